//! Backend storage layer.
//!
//! Defines the transaction contract the backend consumes, an in-memory engine
//! implementing it, the index structures kept in its trees, and the entry
//! container that ties them to the DN lock manager.

/// Secondary indexes.
///
/// Equality indexes, entry ID sets, subtree counters and VLV indexes.
pub mod index;

mod container;
mod entry;
mod memory;
pub mod metrics;
pub mod options;
mod tree;

pub use container::{EntryContainer, IndexConfig, SortedSearch};
pub use entry::{EntryRecord, Modification};
pub use memory::{MemImporter, MemStorage};
pub use metrics::{BackendMetrics, CounterMetrics, NoopMetrics};
pub use options::{BackendConfig, BackendOptions};
pub use tree::{
    Cursor, Importer, ReadableTransaction, Storage, TreeName, UpdateFn, WriteableTransaction,
};
