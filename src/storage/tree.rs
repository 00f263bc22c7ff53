//! Transaction contract consumed from the storage engine.
//!
//! The backend core never touches pages or logs directly; it reads and writes
//! raw byte keys in named trees through these traits. Every mutation issued
//! against one [`WriteableTransaction`] commits or aborts as a unit.

use std::fmt;

use bytes::Bytes;

use crate::types::Result;

/// Two-part tree identifier: the base DN of the entry container and the id of
/// the index (or system tree) within it.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TreeName {
    base_dn: String,
    index_id: String,
}

impl TreeName {
    /// Creates a tree name.
    pub fn new(base_dn: impl Into<String>, index_id: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            index_id: index_id.into(),
        }
    }

    /// Base DN component.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Index id component.
    pub fn index_id(&self) -> &str {
        &self.index_id
    }
}

impl fmt::Display for TreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.base_dn, self.index_id)
    }
}

/// Ordered cursor over one tree.
///
/// A fresh cursor is unpositioned: `next` moves to the first record and
/// `previous` to the last. A failed positioning call leaves the cursor
/// undefined (`key()` returns `None`).
pub trait Cursor {
    /// Advances to the next record, returning `false` past the end.
    fn next(&mut self) -> Result<bool>;

    /// Steps back to the previous record, returning `false` before the start.
    fn previous(&mut self) -> Result<bool>;

    /// Key at the current position.
    fn key(&self) -> Option<&[u8]>;

    /// Value at the current position.
    fn value(&self) -> Option<&[u8]>;

    /// Positions exactly on `key`.
    fn position_to_key(&mut self, key: &[u8]) -> Result<bool>;

    /// Positions on the first record whose key is `>= key`.
    fn position_to_key_or_next(&mut self, key: &[u8]) -> Result<bool>;

    /// Positions on the last record.
    fn position_to_last_key(&mut self) -> Result<bool>;

    /// Positions on the record with 0-based rank `index`.
    fn position_to_index(&mut self, index: usize) -> Result<bool>;

    /// 0-based rank of the current record, the inverse of
    /// [`Cursor::position_to_index`]. `None` when unpositioned.
    fn rank(&self) -> Result<Option<usize>>;
}

/// Read access scoped to one transaction.
pub trait ReadableTransaction {
    /// Reads the value stored under `key`.
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>>;

    /// Opens a cursor over `tree`. Unknown trees yield an empty cursor.
    fn open_cursor(&self, tree: &TreeName) -> Result<Box<dyn Cursor + '_>>;

    /// Number of records in `tree`.
    fn record_count(&self, tree: &TreeName) -> Result<usize>;
}

/// Read-modify-write callback handed to [`WriteableTransaction::update`].
///
/// Receives the current value (if any) and returns the replacement; `None`
/// deletes the record.
pub type UpdateFn<'a> = dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>> + 'a;

/// Write access scoped to one transaction.
pub trait WriteableTransaction: ReadableTransaction {
    /// Opens `tree`, creating it when `create_on_demand` is set.
    fn open_tree(&mut self, tree: &TreeName, create_on_demand: bool) -> Result<()>;

    /// Stores `value` under `key`.
    fn put(&mut self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()>;

    /// Atomically replaces the value under `key` with the callback's result.
    /// Returns whether the stored value changed.
    fn update(&mut self, tree: &TreeName, key: &[u8], f: &mut UpdateFn<'_>) -> Result<bool>;

    /// Deletes `key`, returning whether it existed.
    fn delete(&mut self, tree: &TreeName, key: &[u8]) -> Result<bool>;

    /// Drops the whole tree.
    fn delete_tree(&mut self, tree: &TreeName) -> Result<()>;
}

/// Bulk-load access used before normal read/write traffic starts.
pub trait Importer {
    /// Creates (or truncates) a tree.
    fn create_tree(&mut self, tree: &TreeName) -> Result<()>;

    /// Stores a record without transactional bookkeeping.
    fn put(&mut self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()>;

    /// Reads back a record written during the import.
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>>;
}

/// Storage engine entry point.
pub trait Storage: Send + Sync {
    /// Importer handle type.
    type Importer<'a>: Importer
    where
        Self: 'a;

    /// Runs `f` inside a read-only transaction.
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadableTransaction) -> Result<T>;

    /// Runs `f` inside a write transaction. The transaction commits when `f`
    /// returns `Ok` and discards every mutation when it returns `Err`.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteableTransaction) -> Result<T>;

    /// Starts a bulk import. Normal transactions wait until it is dropped.
    fn start_import(&self) -> Result<Self::Importer<'_>>;
}
