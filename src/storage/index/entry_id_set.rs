use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::primitives::bytes::ord;
use crate::types::{EntryId, Result, StoreError};

/// Size recorded for an undefined set whose membership count is unknown. Also
/// the cap for any size hint.
pub const UNDEFINED_SIZE: u64 = i64::MAX as u64;

const UNDEFINED_TAG: u64 = 1 << 63;

/// The set of entries matching one index key.
///
/// A set is either `Defined`, holding an ascending duplicate-free list of IDs,
/// or `Undefined`, meaning the index gave up enumerating the members and only
/// keeps a size hint. Undefined sets tell the search layer to fall back to a
/// scan.
#[derive(Clone, PartialEq, Eq)]
pub struct EntryIdSet {
    repr: Repr,
}

#[derive(Clone, PartialEq, Eq)]
enum Repr {
    Defined(Vec<EntryId>),
    Undefined { size: u64, key: Option<Bytes> },
}

impl Default for EntryIdSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl EntryIdSet {
    /// An empty defined set.
    pub fn empty() -> Self {
        Self {
            repr: Repr::Defined(Vec::new()),
        }
    }

    /// A defined set holding `ids`, in any order and with duplicates allowed.
    pub fn new_defined_set<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = EntryId>,
    {
        let mut ids: Vec<EntryId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self {
            repr: Repr::Defined(ids),
        }
    }

    /// A defined set over IDs the caller already holds in strictly ascending
    /// order. Fails without allocating a set if the order is violated.
    pub fn new_defined_set_from_sorted(ids: Vec<EntryId>) -> Result<Self> {
        if ids.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(StoreError::Invalid("entry ids must be strictly ascending"));
        }
        Ok(Self {
            repr: Repr::Defined(ids),
        })
    }

    /// An undefined set of unknown size.
    pub fn new_undefined_set() -> Self {
        Self::new_undefined_set_with_size(None, UNDEFINED_SIZE)
    }

    /// An undefined set recording `size` matches for the index `key`.
    pub fn new_undefined_set_with_size(key: Option<&[u8]>, size: u64) -> Self {
        Self {
            repr: Repr::Undefined {
                size: size.min(UNDEFINED_SIZE),
                key: key.map(Bytes::copy_from_slice),
            },
        }
    }

    /// Decodes the persisted form of the set stored under `key`.
    pub fn new_set_from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        if bytes[0] & 0x80 != 0 {
            if bytes.len() != 8 {
                return Err(StoreError::Corruption(
                    "undefined entry id set must be exactly 8 bytes",
                ));
            }
            let size = ord::get_u64_be(bytes)? & !UNDEFINED_TAG;
            return Ok(Self::new_undefined_set_with_size(Some(key), size));
        }
        let mut ids = Vec::with_capacity(bytes.len() / 8);
        for raw in ord::u64_chunks(bytes)? {
            if raw & UNDEFINED_TAG != 0 {
                return Err(StoreError::Corruption("entry id has the undefined tag bit set"));
            }
            let id = EntryId(raw);
            if ids.last().is_some_and(|last| *last >= id) {
                return Err(StoreError::Corruption("entry ids are not strictly ascending"));
            }
            ids.push(id);
        }
        Ok(Self {
            repr: Repr::Defined(ids),
        })
    }

    /// Union of all `sets`. Undefined if any input is undefined.
    pub fn new_set_from_union<'a, I>(sets: I) -> Self
    where
        I: IntoIterator<Item = &'a EntryIdSet>,
    {
        let sets: Vec<&EntryIdSet> = sets.into_iter().collect();
        let mut total = 0u64;
        let mut any_undefined = false;
        for set in &sets {
            if !set.is_defined() {
                any_undefined = true;
            }
            total = saturating_size(total, set.size());
        }
        if any_undefined {
            return Self::new_undefined_set_with_size(None, total);
        }

        let lists: Vec<&[EntryId]> = sets.iter().filter_map(|set| set.as_slice()).collect();
        let mut heap = BinaryHeap::with_capacity(lists.len());
        for (list_idx, list) in lists.iter().enumerate() {
            if let Some(first) = list.first() {
                heap.push(Reverse((*first, list_idx, 0usize)));
            }
        }
        let mut merged: Vec<EntryId> = Vec::with_capacity(total.min(1 << 20) as usize);
        while let Some(Reverse((id, list_idx, pos))) = heap.pop() {
            if merged.last() != Some(&id) {
                merged.push(id);
            }
            if let Some(next) = lists[list_idx].get(pos + 1) {
                heap.push(Reverse((*next, list_idx, pos + 1)));
            }
        }
        Self {
            repr: Repr::Defined(merged),
        }
    }

    /// Whether the set holds an explicit member list.
    pub fn is_defined(&self) -> bool {
        matches!(self.repr, Repr::Defined(_))
    }

    /// Member count, or the size hint of an undefined set.
    pub fn size(&self) -> u64 {
        match &self.repr {
            Repr::Defined(ids) => ids.len() as u64,
            Repr::Undefined { size, .. } => *size,
        }
    }

    /// Whether a defined set has no members. Undefined sets are never empty.
    pub fn is_empty(&self) -> bool {
        match &self.repr {
            Repr::Defined(ids) => ids.is_empty(),
            Repr::Undefined { .. } => false,
        }
    }

    /// Whether `id` may be a member. Always `true` for undefined sets.
    pub fn contains(&self, id: EntryId) -> bool {
        match &self.repr {
            Repr::Defined(ids) => ids.binary_search(&id).is_ok(),
            Repr::Undefined { .. } => true,
        }
    }

    /// Members of a defined set.
    pub fn as_slice(&self) -> Option<&[EntryId]> {
        match &self.repr {
            Repr::Defined(ids) => Some(ids),
            Repr::Undefined { .. } => None,
        }
    }

    /// Members of a defined set as an owned vector; empty when undefined.
    pub fn to_vec(&self) -> Vec<EntryId> {
        self.as_slice().map(<[EntryId]>::to_vec).unwrap_or_default()
    }

    /// Index key an undefined set was degraded for, if recorded.
    pub fn undefined_key(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Defined(_) => None,
            Repr::Undefined { key, .. } => key.as_deref(),
        }
    }

    /// Adds `id`, returning whether the set changed.
    pub fn add(&mut self, id: EntryId) -> bool {
        match &mut self.repr {
            Repr::Defined(ids) => match ids.binary_search(&id) {
                Ok(_) => false,
                Err(pos) => {
                    ids.insert(pos, id);
                    true
                }
            },
            Repr::Undefined { size, .. } => {
                if *size < UNDEFINED_SIZE {
                    *size += 1;
                }
                true
            }
        }
    }

    /// Removes `id`, returning whether the set changed.
    pub fn remove(&mut self, id: EntryId) -> bool {
        match &mut self.repr {
            Repr::Defined(ids) => match ids.binary_search(&id) {
                Ok(pos) => {
                    ids.remove(pos);
                    true
                }
                Err(_) => false,
            },
            Repr::Undefined { size, .. } => {
                if *size < UNDEFINED_SIZE {
                    *size = size.saturating_sub(1);
                }
                true
            }
        }
    }

    /// Adds every member of `other`.
    pub fn add_all(&mut self, other: &EntryIdSet) {
        let next = match (&mut self.repr, &other.repr) {
            (Repr::Defined(ids), Repr::Defined(more)) => {
                if more.is_empty() {
                    return;
                }
                if ids.last().map_or(true, |last| *last < more[0]) {
                    ids.extend_from_slice(more);
                    return;
                }
                Repr::Defined(union_sorted(ids, more))
            }
            (Repr::Defined(ids), Repr::Undefined { size, key }) => Repr::Undefined {
                size: saturating_size(ids.len() as u64, *size),
                key: key.clone(),
            },
            (Repr::Undefined { size, .. }, _) => {
                *size = saturating_size(*size, other.size());
                return;
            }
        };
        self.repr = next;
    }

    /// Removes every member of `other`.
    pub fn remove_all(&mut self, other: &EntryIdSet) {
        let next = match (&mut self.repr, &other.repr) {
            (Repr::Defined(ids), Repr::Defined(less)) => {
                if ids.is_empty() || less.is_empty() {
                    return;
                }
                Repr::Defined(difference_sorted(ids, less))
            }
            (Repr::Defined(ids), Repr::Undefined { key, .. }) => Repr::Undefined {
                size: ids.len() as u64,
                key: key.clone(),
            },
            (Repr::Undefined { size, .. }, Repr::Defined(less)) => {
                if *size < UNDEFINED_SIZE {
                    *size = size.saturating_sub(less.len() as u64);
                }
                return;
            }
            (Repr::Undefined { .. }, Repr::Undefined { .. }) => return,
        };
        self.repr = next;
    }

    /// Keeps only the members also present in `other`.
    ///
    /// Intersecting with a defined set is always computable: an undefined
    /// receiver becomes exactly `other`, and a defined receiver stays defined
    /// when `other` is undefined.
    pub fn retain_all(&mut self, other: &EntryIdSet) {
        let next = match (&mut self.repr, &other.repr) {
            (Repr::Defined(ids), Repr::Defined(keep)) => {
                Repr::Defined(intersect_sorted(ids, keep))
            }
            (Repr::Defined(_), Repr::Undefined { .. }) => return,
            (Repr::Undefined { .. }, Repr::Defined(keep)) => Repr::Defined(keep.clone()),
            (Repr::Undefined { size, .. }, Repr::Undefined { size: other_size, .. }) => {
                *size = (*size).min(*other_size);
                return;
            }
        };
        self.repr = next;
    }

    /// Degrades a defined set holding more than `limit` members to an
    /// undefined set of that size. Returns whether it degraded.
    pub fn apply_entry_limit(&mut self, key: &[u8], limit: usize) -> bool {
        match &self.repr {
            Repr::Defined(ids) if ids.len() > limit => {
                self.repr = Repr::Undefined {
                    size: ids.len() as u64,
                    key: Some(Bytes::copy_from_slice(key)),
                };
                true
            }
            _ => false,
        }
    }

    /// Ascending iterator over the members. Empty for undefined sets.
    pub fn iter(&self) -> EntryIdSetIter<'_> {
        EntryIdSetIter {
            ids: self.as_slice().unwrap_or(&[]),
            pos: 0,
        }
    }

    /// Ascending iterator starting at the first member `>= start`.
    ///
    /// When every member is smaller than `start` the iterator starts over from
    /// the first member instead of being exhausted.
    pub fn iter_from(&self, start: EntryId) -> EntryIdSetIter<'_> {
        let ids = self.as_slice().unwrap_or(&[]);
        let pos = match ids.binary_search(&start) {
            Ok(pos) => pos,
            Err(pos) if pos < ids.len() => pos,
            Err(_) => 0,
        };
        EntryIdSetIter { ids, pos }
    }

    /// Canonical persisted form.
    ///
    /// Defined sets are concatenated big-endian IDs; undefined sets are one
    /// big-endian word with the top bit set and the size hint below it.
    pub fn to_byte_string(&self) -> Bytes {
        match &self.repr {
            Repr::Defined(ids) => {
                let mut out = BytesMut::with_capacity(ids.len() * 8);
                for id in ids {
                    out.put_u64(id.0);
                }
                out.freeze()
            }
            Repr::Undefined { size, .. } => {
                let word = (*size).min(UNDEFINED_SIZE) | UNDEFINED_TAG;
                Bytes::copy_from_slice(&word.to_be_bytes())
            }
        }
    }
}

/// Ascending, restartable iterator over a defined set's members.
#[derive(Clone, Debug)]
pub struct EntryIdSetIter<'a> {
    ids: &'a [EntryId],
    pos: usize,
}

impl EntryIdSetIter<'_> {
    /// Moves back to the first member.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for EntryIdSetIter<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let id = self.ids.get(self.pos).copied()?;
        self.pos += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ids.len().saturating_sub(self.pos);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EntryIdSetIter<'_> {}

impl<'a> IntoIterator for &'a EntryIdSet {
    type Item = EntryId;
    type IntoIter = EntryIdSetIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for EntryIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Defined(ids) => {
                f.write_str("[")?;
                for (idx, id) in ids.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{id}")?;
                }
                f.write_str("]")
            }
            Repr::Undefined { size, .. } if *size == UNDEFINED_SIZE => {
                f.write_str("[NOT-INDEXED]")
            }
            Repr::Undefined { size, key } => {
                let key = key.as_deref().map(hex::encode).unwrap_or_default();
                write!(f, "[LIMIT-EXCEEDED:{key}] COUNT: {size}")
            }
        }
    }
}

impl fmt::Debug for EntryIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryIdSet{self}")
    }
}

fn saturating_size(a: u64, b: u64) -> u64 {
    a.saturating_add(b).min(UNDEFINED_SIZE)
}

fn union_sorted(a: &[EntryId], b: &[EntryId]) -> Vec<EntryId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn difference_sorted(a: &[EntryId], b: &[EntryId]) -> Vec<EntryId> {
    let mut out = Vec::with_capacity(a.len());
    let mut j = 0;
    for id in a {
        while j < b.len() && b[j] < *id {
            j += 1;
        }
        if j >= b.len() || b[j] != *id {
            out.push(*id);
        }
    }
    out
}

fn intersect_sorted(a: &[EntryId], b: &[EntryId]) -> Vec<EntryId> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}
