#![forbid(unsafe_code)]
//! Hierarchical DN lock manager.
//!
//! Entry locks cover one DN; subtree locks cover a DN and everything beneath
//! it. Instead of locking every ancestor, each DN's state records which
//! contexts hold locks strictly beneath it, so a subtree request can see
//! conflicting descendants and an entry request can see conflicting ancestor
//! subtrees by inspecting the chain from the root-most RDN down to the
//! target. The chain's internal mutexes are always taken root-most first,
//! which keeps lock-state inspection itself free of ordering cycles.

mod context;
mod table;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::storage::metrics::{default_metrics, BackendMetrics};
use crate::storage::options::BackendOptions;
use crate::types::Dn;

pub use context::LockContext;

use context::Chain;
use table::{check, DnState, LockTable, Verdict};

/// Identity of a lock-acquiring worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

/// The kind of a DN lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared lock on one entry.
    ReadEntry,
    /// Exclusive lock on one entry.
    WriteEntry,
    /// Exclusive lock on an entry and its whole subtree.
    WriteSubtree,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockType::ReadEntry => "read-entry",
            LockType::WriteEntry => "write-entry",
            LockType::WriteSubtree => "write-subtree",
        })
    }
}

/// Shared DN lock manager. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
    timeout: Duration,
    cache_capacity: usize,
    metrics: Arc<dyn BackendMetrics>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(&BackendOptions::default())
    }
}

impl LockManager {
    /// Creates an independent lock manager.
    pub fn new(options: &BackendOptions) -> Self {
        Self {
            table: Arc::new(LockTable::new(options.lock_table_shards)),
            timeout: options.lock_timeout,
            cache_capacity: options.lock_cache_capacity,
            metrics: options.metrics.clone().unwrap_or_else(default_metrics),
        }
    }

    /// Creates a context for one worker. Contexts must not be shared between
    /// concurrently running operations.
    pub fn context(&self) -> LockContext {
        LockContext::new(Arc::clone(&self.table), self.cache_capacity)
    }

    /// Default wait applied by the `try_*` methods.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of DNs currently present in the lock table.
    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Whether `dn` currently has an entry in the lock table.
    pub fn is_tracked(&self, dn: &Dn) -> bool {
        self.table.contains(dn)
    }

    /// Acquires a shared lock on `dn`.
    pub fn try_read_lock_entry(&self, ctx: &mut LockContext, dn: &Dn) -> Option<DnLock> {
        self.try_lock(ctx, dn, LockType::ReadEntry, self.timeout)
    }

    /// Acquires an exclusive lock on `dn`.
    pub fn try_write_lock_entry(&self, ctx: &mut LockContext, dn: &Dn) -> Option<DnLock> {
        self.try_lock(ctx, dn, LockType::WriteEntry, self.timeout)
    }

    /// Acquires an exclusive lock on `dn` and everything beneath it.
    ///
    /// The root DN cannot be subtree-locked; such requests return `None`.
    pub fn try_write_lock_subtree(&self, ctx: &mut LockContext, dn: &Dn) -> Option<DnLock> {
        self.try_lock(ctx, dn, LockType::WriteSubtree, self.timeout)
    }

    /// Acquires a lock of `kind` on `dn`, waiting at most `timeout`.
    ///
    /// Returns `None` when the deadline passes, or immediately when `ctx`
    /// already holds a weaker lock on `dn` that the request would have to
    /// upgrade or when a subtree lock on the root DN is requested. In every
    /// case the lock state is left as it was.
    pub fn try_lock(
        &self,
        ctx: &mut LockContext,
        dn: &Dn,
        kind: LockType,
        timeout: Duration,
    ) -> Option<DnLock> {
        if !ctx.belongs_to(&self.table) {
            debug!(%dn, "lock context belongs to another lock manager");
            return None;
        }
        // Chains start below the root, so a root subtree lock could not
        // exclude anything.
        if kind == LockType::WriteSubtree && dn.is_root() {
            debug!("refused subtree lock on the root DN");
            return None;
        }
        let owner = ctx.id();
        let chain = ctx.resolve_chain(dn);
        let deadline = Instant::now() + timeout;
        loop {
            let mut guards: SmallVec<[MutexGuard<'_, DnState>; 8]> =
                chain.iter().map(|node| node.state.lock()).collect();
            let states: SmallVec<[&DnState; 8]> = guards.iter().map(|g| &**g).collect();
            let verdict = check(&states, owner, kind);
            drop(states);
            match verdict {
                Verdict::Grant => {
                    if let Some((target, ancestors)) = guards.split_last_mut() {
                        target.grant(owner, kind);
                        for ancestor in ancestors.iter_mut() {
                            ancestor.add_beneath(owner);
                        }
                    }
                    drop(guards);
                    trace!(%dn, %kind, ctx = owner.0, "dn lock granted");
                    self.metrics.lock_granted(kind);
                    return Some(DnLock {
                        table: Arc::clone(&self.table),
                        owner,
                        kind,
                        chain,
                        released: false,
                    });
                }
                Verdict::Refuse => {
                    drop(guards);
                    debug!(%dn, %kind, ctx = owner.0, "refused lock upgrade within one context");
                    ctx.release_chain(&chain);
                    return None;
                }
                Verdict::Blocked(idx) => {
                    let mut guard = guards.swap_remove(idx);
                    drop(guards);
                    let timed_out = chain[idx].cond.wait_until(&mut guard, deadline).timed_out();
                    drop(guard);
                    if timed_out {
                        debug!(%dn, %kind, ctx = owner.0, ?timeout, "dn lock timed out");
                        self.metrics.lock_timed_out(kind);
                        ctx.release_chain(&chain);
                        return None;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("timeout", &self.timeout)
            .field("cache_capacity", &self.cache_capacity)
            .field("tracked", &self.table.len())
            .finish()
    }
}

/// A held DN lock. Released by [`DnLock::unlock`] or on drop.
pub struct DnLock {
    table: Arc<LockTable>,
    owner: ContextId,
    kind: LockType,
    chain: Chain,
    released: bool,
}

impl DnLock {
    /// The locked DN.
    pub fn dn(&self) -> &Dn {
        &self.target().dn
    }

    /// The kind of this lock.
    pub fn lock_type(&self) -> LockType {
        self.kind
    }

    /// Current references on this DN's lock state, counting every live lock
    /// handle and every context cache entry.
    pub fn ref_count(&self) -> usize {
        self.target()
            .refs
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Releases the lock.
    pub fn unlock(mut self) {
        self.release();
    }

    fn target(&self) -> &table::DnNode {
        // The chain always ends with the target.
        &self.chain[self.chain.len() - 1]
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some((target, ancestors)) = self.chain.split_last() {
            target.state.lock().ungrant(self.owner, self.kind);
            target.cond.notify_all();
            for ancestor in ancestors.iter().rev() {
                let drained = ancestor.state.lock().remove_beneath(self.owner);
                if drained {
                    ancestor.cond.notify_all();
                }
            }
            trace!(dn = %target.dn, kind = %self.kind, ctx = self.owner.0, "dn lock released");
        }
        for node in &self.chain {
            self.table.release(node);
        }
    }
}

impl Drop for DnLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DnLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DnLock({} {})", self.kind, self.dn())
    }
}
