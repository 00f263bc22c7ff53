//! Secondary indexes maintained inside backend write transactions.

mod attribute;
mod entry_id_set;
mod id2count;
pub mod vlv;

pub use attribute::AttributeIndex;
pub use entry_id_set::{EntryIdSet, EntryIdSetIter, UNDEFINED_SIZE};
pub use id2count::{Id2Count, TOTAL_COUNT_ID};
