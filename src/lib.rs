//! Concurrency-control and indexing core of a directory-server storage backend.
//!
//! The crate provides a hierarchical DN lock manager, entry ID sets with a
//! degrade-to-undefined fallback, sharded subtree counters and virtual list
//! view indexes, all written against an abstract transactional key/value
//! engine. [`storage::EntryContainer`] wires them together along the backend
//! write path.

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;
