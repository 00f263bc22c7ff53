//! Virtual list view indexes.
//!
//! A VLV index stores one empty-valued record per entry in scope, keyed by the
//! entry's encoded sort values followed by its big-endian entry id. A cursor
//! walk over the tree therefore yields entries in sort order with ties broken
//! by ascending id.

pub mod key;
mod window;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::trace;

use crate::primitives::bytes::ord;
use crate::storage::metrics::BackendMetrics;
use crate::storage::tree::{Importer, ReadableTransaction, TreeName, WriteableTransaction};
use crate::types::{Dn, EntryId, Result, StoreError};

pub use window::{UnindexedVlv, VlvResult, VlvResultCode};

use window::Window;

/// Which entries relative to a base DN a VLV index covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the base entry.
    BaseObject,
    /// Immediate children of the base.
    SingleLevel,
    /// The base and everything beneath it.
    WholeSubtree,
    /// Everything beneath the base, excluding the base itself.
    Subordinates,
}

impl SearchScope {
    /// Whether `dn` falls inside this scope around `base`.
    pub fn should_include(&self, base: &Dn, dn: &Dn) -> bool {
        match self {
            SearchScope::BaseObject => dn == base,
            SearchScope::SingleLevel => dn.parent().as_ref() == Some(base),
            SearchScope::WholeSubtree => dn.is_in_subtree_of(base),
            SearchScope::Subordinates => dn.is_descendant_of(base),
        }
    }
}

impl FromStr for SearchScope {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" | "base-object" => Ok(SearchScope::BaseObject),
            "one" | "single-level" => Ok(SearchScope::SingleLevel),
            "sub" | "whole-subtree" => Ok(SearchScope::WholeSubtree),
            "subordinates" | "subordinate-subtree" => Ok(SearchScope::Subordinates),
            _ => Err(StoreError::Invalid("unknown search scope")),
        }
    }
}

/// One attribute of a sort order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    /// Attribute type, lower-cased.
    pub attribute: String,
    /// Sort direction.
    pub ascending: bool,
}

/// An ordered list of sort keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortOrder {
    keys: Vec<SortKey>,
}

impl SortOrder {
    /// Creates a sort order. At least one key is required.
    pub fn new(keys: Vec<SortKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(StoreError::Invalid("sort order needs at least one key"));
        }
        Ok(Self { keys })
    }

    /// Parses a whitespace separated list such as `"-sn +givenname cn"`; a
    /// leading `-` sorts descending.
    pub fn parse(text: &str) -> Result<Self> {
        let keys = text
            .split_whitespace()
            .map(|token| {
                let (ascending, attribute) = match token.as_bytes()[0] {
                    b'-' => (false, &token[1..]),
                    b'+' => (true, &token[1..]),
                    _ => (true, token),
                };
                if attribute.is_empty() {
                    return Err(StoreError::Invalid("sort key without an attribute"));
                }
                Ok(SortKey {
                    attribute: attribute.to_lowercase(),
                    ascending,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys)
    }

    /// The sort keys.
    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Storage key for `values`: every sort value encoded in its direction,
    /// then the entry id.
    pub fn encode_key(&self, values: &SortValues) -> Result<Vec<u8>> {
        if values.values.len() != self.keys.len() {
            return Err(StoreError::Invalid("sort value count does not match the sort order"));
        }
        let mut out = Vec::new();
        for (sort_key, value) in self.keys.iter().zip(&values.values) {
            let normalized = value.as_deref().map(key::normalize_value);
            key::encode_vlv_key_value(
                normalized.as_deref().map(str::as_bytes),
                &mut out,
                sort_key.ascending,
            );
        }
        ord::put_u64_be(&mut out, values.entry_id.get());
        Ok(out)
    }

    /// Seek key for an assertion on the first sort key.
    pub fn encode_assertion(&self, assertion: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let normalized = key::normalize_value(assertion);
        key::encode_vlv_key_value(Some(normalized.as_bytes()), &mut out, self.keys[0].ascending);
        out
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, key) in self.keys.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            if !key.ascending {
                f.write_str("-")?;
            }
            f.write_str(&key.attribute)?;
        }
        Ok(())
    }
}

/// An entry's values for each key of a sort order, `None` where the entry has
/// no value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortValues {
    /// Owning entry.
    pub entry_id: EntryId,
    /// One value per sort key.
    pub values: Vec<Option<String>>,
}

impl SortValues {
    /// Creates sort values for `entry_id`.
    pub fn new(entry_id: EntryId, values: Vec<Option<String>>) -> Self {
        Self { entry_id, values }
    }
}

/// Definition of one VLV index.
#[derive(Clone, Debug)]
pub struct VlvIndexConfig {
    /// Index name, unique within the container.
    pub name: String,
    /// Search base the index covers.
    pub base_dn: Dn,
    /// Search scope around `base_dn`.
    pub scope: SearchScope,
    /// Published sort order.
    pub sort_order: SortOrder,
}

/// A maintained VLV index.
#[derive(Clone)]
pub struct VlvIndex {
    config: VlvIndexConfig,
    tree: TreeName,
    metrics: Arc<dyn BackendMetrics>,
}

impl VlvIndex {
    /// Creates the index described by `config` inside the container rooted at
    /// `container_base`.
    pub fn new(container_base: &Dn, config: VlvIndexConfig, metrics: Arc<dyn BackendMetrics>) -> Self {
        Self {
            tree: TreeName::new(container_base.to_string(), format!("vlv.{}", config.name)),
            config,
            metrics,
        }
    }

    /// Index definition.
    pub fn config(&self) -> &VlvIndexConfig {
        &self.config
    }

    /// Backing tree.
    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    /// Opens the backing tree.
    pub fn open<T>(&self, txn: &mut T, create_on_demand: bool) -> Result<()>
    where
        T: WriteableTransaction + ?Sized,
    {
        txn.open_tree(&self.tree, create_on_demand)
    }

    /// Whether an entry at `dn` belongs in this index.
    pub fn should_include(&self, dn: &Dn) -> bool {
        self.config.scope.should_include(&self.config.base_dn, dn)
    }

    /// Indexes an entry. Returns `false` when `dn` is out of scope.
    pub fn add_entry<T>(&self, txn: &mut T, dn: &Dn, values: &SortValues) -> Result<bool>
    where
        T: WriteableTransaction + ?Sized,
    {
        if !self.should_include(dn) {
            return Ok(false);
        }
        let key = self.config.sort_order.encode_key(values)?;
        txn.put(&self.tree, &key, &[])?;
        Ok(true)
    }

    /// Removes an entry. Returns whether a record was deleted.
    pub fn remove_entry<T>(&self, txn: &mut T, dn: &Dn, values: &SortValues) -> Result<bool>
    where
        T: WriteableTransaction + ?Sized,
    {
        if !self.should_include(dn) {
            return Ok(false);
        }
        let key = self.config.sort_order.encode_key(values)?;
        txn.delete(&self.tree, &key)
    }

    /// Re-keys an entry whose sort values changed. Returns `false` when the
    /// encoded key is unchanged.
    pub fn modify_entry<T>(
        &self,
        txn: &mut T,
        dn: &Dn,
        old: &SortValues,
        new: &SortValues,
    ) -> Result<bool>
    where
        T: WriteableTransaction + ?Sized,
    {
        if !self.should_include(dn) {
            return Ok(false);
        }
        let old_key = self.config.sort_order.encode_key(old)?;
        let new_key = self.config.sort_order.encode_key(new)?;
        if old_key == new_key {
            return Ok(false);
        }
        txn.delete(&self.tree, &old_key)?;
        txn.put(&self.tree, &new_key, &[])?;
        Ok(true)
    }

    /// Writes an entry during a bulk import. Scope is the caller's concern.
    pub fn import_put<I>(&self, importer: &mut I, values: &SortValues) -> Result<()>
    where
        I: Importer + ?Sized,
    {
        let key = self.config.sort_order.encode_key(values)?;
        importer.put(&self.tree, &key, &[])
    }

    /// Number of indexed entries.
    pub fn count<T>(&self, txn: &T) -> Result<u64>
    where
        T: ReadableTransaction + ?Sized,
    {
        Ok(txn.record_count(&self.tree)? as u64)
    }

    /// Every indexed entry in sort order.
    pub fn entries<T>(&self, txn: &T) -> Result<Vec<EntryId>>
    where
        T: ReadableTransaction + ?Sized,
    {
        let count = txn.record_count(&self.tree)?;
        self.read_window(txn, Window::around(count, 0, count, 0))
    }

    /// Window by 1-based offset.
    pub fn vlv_by_offset<T>(&self, txn: &T, before: usize, after: usize, offset: i64) -> Result<VlvResult>
    where
        T: ReadableTransaction + ?Sized,
    {
        self.metrics.vlv_request(true);
        let count = txn.record_count(&self.tree)?;
        let Some(window) = Window::by_offset(count, before, after, offset) else {
            trace!(index = %self.config.name, offset, "vlv offset out of range");
            return Ok(VlvResult::offset_range_error(count as u64));
        };
        Ok(VlvResult {
            entries: self.read_window(txn, window)?,
            target_position: window.target_position,
            content_count: count as u64,
            result_code: VlvResultCode::Success,
        })
    }

    /// Window around the first entry whose first sort value is at or after
    /// `assertion` in sort order.
    pub fn vlv_by_assertion<T>(
        &self,
        txn: &T,
        before: usize,
        after: usize,
        assertion: &str,
    ) -> Result<VlvResult>
    where
        T: ReadableTransaction + ?Sized,
    {
        self.metrics.vlv_request(true);
        let count = txn.record_count(&self.tree)?;
        let seek_key = self.config.sort_order.encode_assertion(assertion);
        let target = self.rank_of_first_at_or_after(txn, &seek_key)?;
        let window = Window::around(count, before, after, target);
        Ok(VlvResult {
            entries: self.read_window(txn, window)?,
            target_position: window.target_position,
            content_count: count as u64,
            result_code: VlvResultCode::Success,
        })
    }

    fn rank_of_first_at_or_after<T>(&self, txn: &T, seek_key: &[u8]) -> Result<usize>
    where
        T: ReadableTransaction + ?Sized,
    {
        let mut cursor = txn.open_cursor(&self.tree)?;
        if !cursor.position_to_key_or_next(seek_key)? {
            return txn.record_count(&self.tree);
        }
        cursor
            .rank()?
            .ok_or_else(|| StoreError::Storage("positioned cursor reported no rank".into()))
    }

    fn read_window<T>(&self, txn: &T, window: Window) -> Result<Vec<EntryId>>
    where
        T: ReadableTransaction + ?Sized,
    {
        let mut out = Vec::with_capacity(window.len());
        if window.len() == 0 {
            return Ok(out);
        }
        let mut cursor = txn.open_cursor(&self.tree)?;
        let mut positioned = cursor.position_to_index(window.start)?;
        while positioned && out.len() < window.len() {
            let key = cursor
                .key()
                .ok_or(StoreError::Corruption("vlv cursor lost its position"))?;
            out.push(entry_id_of(key)?);
            positioned = cursor.next()?;
        }
        Ok(out)
    }
}

impl fmt::Debug for VlvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VlvIndex")
            .field("config", &self.config)
            .field("tree", &self.tree)
            .finish()
    }
}

fn entry_id_of(key: &[u8]) -> Result<EntryId> {
    let tail = key
        .len()
        .checked_sub(8)
        .ok_or(StoreError::Corruption("vlv key shorter than an entry id"))?;
    EntryId::new(ord::get_u64_be(&key[tail..])?)
        .map_err(|_| StoreError::Corruption("vlv key ends in an out-of-range entry id"))
}
