use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use smallvec::SmallVec;

use crate::types::Dn;

use super::table::{DnNode, LockTable};
use super::ContextId;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

pub(crate) type Chain = SmallVec<[Arc<DnNode>; 8]>;

/// Per-worker lock state: an identity for reentrancy plus a bounded LRU of
/// recently touched DN nodes.
///
/// Each cached node holds one reference in the lock table, so a hot parent
/// stays resident between operations. Eviction and drop hand those references
/// back without touching locks that are still held.
pub struct LockContext {
    id: ContextId,
    table: Arc<LockTable>,
    cache: Option<LruCache<Dn, Arc<DnNode>>>,
}

impl LockContext {
    pub(crate) fn new(table: Arc<LockTable>, capacity: usize) -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)),
            table,
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// Identity used to recognise reentrant requests.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Number of DN nodes currently cached.
    pub fn cached(&self) -> usize {
        self.cache.as_ref().map_or(0, LruCache::len)
    }

    pub(crate) fn belongs_to(&self, table: &Arc<LockTable>) -> bool {
        Arc::ptr_eq(&self.table, table)
    }

    /// Resolves the nodes for every strict ancestor of `dn` and for `dn`
    /// itself, root-most first, taking one reference on each.
    pub(crate) fn resolve_chain(&mut self, dn: &Dn) -> Chain {
        let mut chain = Chain::with_capacity(dn.depth() + 1);
        for ancestor in dn.ancestors() {
            chain.push(self.node(&ancestor));
        }
        chain.push(self.node(dn));
        chain
    }

    pub(crate) fn release_chain(&self, chain: &Chain) {
        for node in chain {
            self.table.release(node);
        }
    }

    fn node(&mut self, dn: &Dn) -> Arc<DnNode> {
        let Some(cache) = self.cache.as_mut() else {
            return self.table.acquire(dn);
        };
        if let Some(node) = cache.get(dn) {
            node.retain();
            return Arc::clone(node);
        }
        let node = self.table.acquire(dn);
        node.retain();
        if let Some((_, evicted)) = cache.push(dn.clone(), Arc::clone(&node)) {
            self.table.release(&evicted);
        }
        node
    }
}

impl Drop for LockContext {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            while let Some((_, node)) = cache.pop_lru() {
                self.table.release(&node);
            }
        }
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("id", &self.id)
            .field("cached", &self.cached())
            .finish()
    }
}
