use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::primitives::concurrency::LockType;

/// Hooks for observing backend activity.
///
/// Implementations must be cheap: hooks are invoked on the lock acquisition
/// path and inside write transactions.
pub trait BackendMetrics: Send + Sync {
    /// Records a granted DN lock.
    fn lock_granted(&self, kind: LockType);

    /// Records a DN lock request that gave up at its deadline.
    fn lock_timed_out(&self, kind: LockType);

    /// Records an index entry that crossed the entry limit and became undefined.
    fn index_entry_degraded(&self, index: &str);

    /// Records a served VLV request.
    ///
    /// # Parameters
    /// * `indexed` - Whether a maintained VLV index answered the request (`true`)
    ///   or the candidate set was sorted on the fly (`false`).
    fn vlv_request(&self, indexed: bool);
}

/// A [`BackendMetrics`] sink that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl BackendMetrics for NoopMetrics {
    fn lock_granted(&self, _kind: LockType) {}
    fn lock_timed_out(&self, _kind: LockType) {}
    fn index_entry_degraded(&self, _index: &str) {}
    fn vlv_request(&self, _indexed: bool) {}
}

/// Atomic counters for every [`BackendMetrics`] hook.
#[derive(Default, Debug)]
pub struct CounterMetrics {
    /// Granted read-entry locks.
    pub read_locks: AtomicU64,

    /// Granted write-entry locks.
    pub write_locks: AtomicU64,

    /// Granted write-subtree locks.
    pub subtree_locks: AtomicU64,

    /// Lock requests that timed out.
    pub lock_timeouts: AtomicU64,

    /// Index entries degraded to undefined sets.
    pub degraded_entries: AtomicU64,

    /// VLV requests answered by a maintained index.
    pub vlv_indexed: AtomicU64,

    /// VLV requests answered by sorting candidates.
    pub vlv_unindexed: AtomicU64,
}

impl BackendMetrics for CounterMetrics {
    fn lock_granted(&self, kind: LockType) {
        let counter = match kind {
            LockType::ReadEntry => &self.read_locks,
            LockType::WriteEntry => &self.write_locks,
            LockType::WriteSubtree => &self.subtree_locks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_timed_out(&self, _kind: LockType) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn index_entry_degraded(&self, _index: &str) {
        self.degraded_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn vlv_request(&self, indexed: bool) {
        if indexed {
            self.vlv_indexed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.vlv_unindexed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Returns the default metrics sink, a [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn BackendMetrics> {
    Arc::new(NoopMetrics)
}
