//! Low-level building blocks shared by the backend components.

/// Order-preserving and varint encoders.
///
/// Used by the index codecs to build byte-comparable keys and compact values.
pub mod bytes;

/// Hierarchical DN locking.
///
/// Entry and subtree locks with per-worker caches and bounded waits.
pub mod concurrency;
