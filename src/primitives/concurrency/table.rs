//! Shared DN lock table and per-DN lock state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh64::xxh64;

use crate::types::Dn;

use super::{ContextId, LockType};

type Shard = Mutex<FxHashMap<Dn, Arc<DnNode>>>;

/// Process-wide map from DN to lock state, split into independently locked
/// shards.
pub(crate) struct LockTable {
    shards: Box<[Shard]>,
}

impl LockTable {
    pub(crate) fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }

    fn shard(&self, dn: &Dn) -> &Shard {
        let idx = (xxh64(&dn.to_key(), 0) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Looks up (or inserts) the node for `dn` and takes one reference on it.
    pub(crate) fn acquire(&self, dn: &Dn) -> Arc<DnNode> {
        let mut shard = self.shard(dn).lock();
        let node = shard
            .entry(dn.clone())
            .or_insert_with(|| Arc::new(DnNode::new(dn.clone())))
            .clone();
        node.refs.fetch_add(1, Ordering::AcqRel);
        node
    }

    /// Drops one reference, removing the node from the table at zero.
    ///
    /// The decrement happens under the shard lock so a concurrent `acquire`
    /// never revives a node that is being removed.
    pub(crate) fn release(&self, node: &Arc<DnNode>) {
        let mut shard = self.shard(&node.dn).lock();
        if node.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(current) = shard.get(&node.dn) {
                if Arc::ptr_eq(current, node) {
                    shard.remove(&node.dn);
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub(crate) fn contains(&self, dn: &Dn) -> bool {
        self.shard(dn).lock().contains_key(dn)
    }
}

/// Lock state for one DN.
pub(crate) struct DnNode {
    pub(crate) dn: Dn,
    /// Lock handles plus cache entries referencing this node.
    pub(crate) refs: AtomicUsize,
    pub(crate) state: Mutex<DnState>,
    pub(crate) cond: Condvar,
}

impl DnNode {
    fn new(dn: Dn) -> Self {
        Self {
            dn,
            refs: AtomicUsize::new(0),
            state: Mutex::new(DnState::default()),
            cond: Condvar::new(),
        }
    }

    /// Takes an extra reference on a node the caller already references.
    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }
}

/// Hold counts of one context on one DN.
#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct Held {
    read: u32,
    write: u32,
    subtree: u32,
}

impl Held {
    fn is_empty(&self) -> bool {
        self.read == 0 && self.write == 0 && self.subtree == 0
    }

    fn slot(&mut self, kind: LockType) -> &mut u32 {
        match kind {
            LockType::ReadEntry => &mut self.read,
            LockType::WriteEntry => &mut self.write,
            LockType::WriteSubtree => &mut self.subtree,
        }
    }
}

/// Held-lock sets keyed by acquiring context.
#[derive(Default, Debug)]
pub(crate) struct DnState {
    holders: SmallVec<[(ContextId, Held); 2]>,
    /// Per context, the number of locks held strictly beneath this DN.
    beneath: SmallVec<[(ContextId, usize); 2]>,
}

/// Outcome of checking a request against the current state of its chain.
pub(crate) enum Verdict {
    Grant,
    /// Same-context request that would need to upgrade a weaker hold.
    Refuse,
    /// Conflict recorded in the chain node at this index.
    Blocked(usize),
}

impl DnState {
    fn held_by(&self, ctx: ContextId) -> Held {
        self.holders
            .iter()
            .find(|(id, _)| *id == ctx)
            .map(|(_, held)| *held)
            .unwrap_or_default()
    }

    fn others(&self, ctx: ContextId) -> impl Iterator<Item = &Held> {
        self.holders
            .iter()
            .filter(move |(id, _)| *id != ctx)
            .map(|(_, held)| held)
    }

    fn others_beneath(&self, ctx: ContextId) -> bool {
        self.beneath.iter().any(|(id, n)| *id != ctx && *n > 0)
    }

    pub(crate) fn grant(&mut self, ctx: ContextId, kind: LockType) {
        if let Some((_, held)) = self.holders.iter_mut().find(|(id, _)| *id == ctx) {
            *held.slot(kind) += 1;
            return;
        }
        let mut held = Held::default();
        *held.slot(kind) = 1;
        self.holders.push((ctx, held));
    }

    pub(crate) fn ungrant(&mut self, ctx: ContextId, kind: LockType) {
        if let Some(pos) = self.holders.iter().position(|(id, _)| *id == ctx) {
            let held = &mut self.holders[pos].1;
            let slot = held.slot(kind);
            *slot = slot.saturating_sub(1);
            if held.is_empty() {
                self.holders.swap_remove(pos);
            }
        }
    }

    pub(crate) fn add_beneath(&mut self, ctx: ContextId) {
        if let Some((_, n)) = self.beneath.iter_mut().find(|(id, _)| *id == ctx) {
            *n += 1;
        } else {
            self.beneath.push((ctx, 1));
        }
    }

    /// Returns `true` when the context no longer holds anything beneath.
    pub(crate) fn remove_beneath(&mut self, ctx: ContextId) -> bool {
        let Some(pos) = self.beneath.iter().position(|(id, _)| *id == ctx) else {
            return false;
        };
        let n = &mut self.beneath[pos].1;
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.beneath.swap_remove(pos);
            return true;
        }
        false
    }
}

/// Checks a request for `kind` against `chain`, ordered root-most first with
/// the target last.
pub(crate) fn check(chain: &[&DnState], ctx: ContextId, kind: LockType) -> Verdict {
    let Some((target, ancestors)) = chain.split_last() else {
        return Verdict::Refuse;
    };
    for (idx, ancestor) in ancestors.iter().enumerate() {
        if ancestor.others(ctx).any(|held| held.subtree > 0) {
            return Verdict::Blocked(idx);
        }
    }
    let target_idx = ancestors.len();
    let mine = target.held_by(ctx);
    match kind {
        LockType::ReadEntry => {
            if !mine.is_empty() {
                return Verdict::Grant;
            }
            if target.others(ctx).any(|held| held.write > 0 || held.subtree > 0) {
                return Verdict::Blocked(target_idx);
            }
        }
        LockType::WriteEntry => {
            if mine.write > 0 || mine.subtree > 0 {
                return Verdict::Grant;
            }
            if mine.read > 0 {
                return Verdict::Refuse;
            }
            if target.others(ctx).next().is_some() {
                return Verdict::Blocked(target_idx);
            }
        }
        LockType::WriteSubtree => {
            if mine.subtree > 0 {
                return Verdict::Grant;
            }
            if mine.read > 0 || mine.write > 0 {
                return Verdict::Refuse;
            }
            if target.others(ctx).next().is_some() || target.others_beneath(ctx) {
                return Verdict::Blocked(target_idx);
            }
        }
    }
    Verdict::Grant
}
