use std::fmt;

use crate::types::{EntryId, Result};

use super::{SortOrder, SortValues};

/// Outcome code of a VLV request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VlvResultCode {
    /// The window was computed.
    Success,
    /// The requested offset was negative.
    OffsetRangeError,
}

/// A page of a sorted result plus the position information the client needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlvResult {
    /// Entries in the window, in sort order.
    pub entries: Vec<EntryId>,
    /// 1-based position of the target entry; `content_count + 1` when the
    /// target lies past the end.
    pub target_position: u64,
    /// Number of entries in the whole sorted list.
    pub content_count: u64,
    /// Outcome code.
    pub result_code: VlvResultCode,
}

impl VlvResult {
    pub(crate) fn offset_range_error(content_count: u64) -> Self {
        Self {
            entries: Vec::new(),
            target_position: 0,
            content_count,
            result_code: VlvResultCode::OffsetRangeError,
        }
    }
}

impl fmt::Display for VlvResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} target={} count={} entries=[",
            self.result_code, self.target_position, self.content_count
        )?;
        for (idx, id) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("]")
    }
}

/// Half-open rank range `[start, end)` of the sorted list to return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) target_position: u64,
}

impl Window {
    /// Window around the 0-based rank `target`, which may equal `count`.
    pub(crate) fn around(count: usize, before: usize, after: usize, target: usize) -> Self {
        let target = target.min(count);
        let start = target - before.min(target);
        let end = target.saturating_add(after).saturating_add(1).min(count);
        Self {
            start,
            end: end.max(start),
            target_position: target as u64 + 1,
        }
    }

    /// Window for a 1-based `offset`. Offsets below 1 count as 1 and offsets
    /// past the end as `count + 1`; negative offsets yield `None`.
    pub(crate) fn by_offset(count: usize, before: usize, after: usize, offset: i64) -> Option<Self> {
        if offset < 0 {
            return None;
        }
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let target = offset.max(1).min(count.saturating_add(1));
        Some(Self::around(count, before, after, target - 1))
    }

    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }
}

/// VLV over a candidate set with no maintained index: every candidate is keyed
/// with the same encoding the index uses, then sorted in memory.
#[derive(Clone, Debug)]
pub struct UnindexedVlv {
    sort_order: SortOrder,
    sorted: Vec<(Vec<u8>, EntryId)>,
}

impl UnindexedVlv {
    /// Sorts `candidates` by `sort_order`.
    pub fn new<I>(sort_order: SortOrder, candidates: I) -> Result<Self>
    where
        I: IntoIterator<Item = SortValues>,
    {
        let mut sorted = candidates
            .into_iter()
            .map(|values| Ok((sort_order.encode_key(&values)?, values.entry_id)))
            .collect::<Result<Vec<_>>>()?;
        sorted.sort_unstable();
        Ok(Self { sort_order, sorted })
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Whether there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Every candidate in sort order.
    pub fn entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.sorted.iter().map(|(_, id)| *id)
    }

    /// Window by 1-based offset.
    pub fn by_offset(&self, before: usize, after: usize, offset: i64) -> VlvResult {
        let count = self.sorted.len();
        match Window::by_offset(count, before, after, offset) {
            Some(window) => self.collect(window),
            None => VlvResult::offset_range_error(count as u64),
        }
    }

    /// Window around the first candidate whose first sort value is at or
    /// after `assertion` in sort order.
    pub fn by_assertion(&self, before: usize, after: usize, assertion: &str) -> VlvResult {
        let seek_key = self.sort_order.encode_assertion(assertion);
        let target = self
            .sorted
            .partition_point(|(key, _)| key.as_slice() < seek_key.as_slice());
        self.collect(Window::around(self.sorted.len(), before, after, target))
    }

    fn collect(&self, window: Window) -> VlvResult {
        VlvResult {
            entries: self.sorted[window.start..window.end]
                .iter()
                .map(|(_, id)| *id)
                .collect(),
            target_position: window.target_position,
            content_count: self.sorted.len() as u64,
            result_code: VlvResultCode::Success,
        }
    }
}
