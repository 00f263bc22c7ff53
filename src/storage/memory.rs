//! In-memory storage engine implementing the transaction contract.
//!
//! Trees are ordered maps shared behind `Arc`; a write transaction clones a
//! tree the first time it modifies it and publishes the clones on commit, so an
//! aborted transaction leaves nothing behind. Writers are serialized and
//! exclude readers for their duration.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::trace;

use crate::types::{Result, StoreError};

use super::tree::{
    Cursor, Importer, ReadableTransaction, Storage, TreeName, UpdateFn, WriteableTransaction,
};

type Tree = BTreeMap<Bytes, Bytes>;
type Trees = BTreeMap<TreeName, Arc<Tree>>;

/// Thread-safe in-memory [`Storage`].
#[derive(Default)]
pub struct MemStorage {
    trees: RwLock<Trees>,
}

impl MemStorage {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all trees currently present.
    pub fn tree_names(&self) -> Vec<TreeName> {
        self.trees.read().keys().cloned().collect()
    }
}

impl Storage for MemStorage {
    type Importer<'a> = MemImporter<'a>;

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadableTransaction) -> Result<T>,
    {
        let guard = self.trees.read();
        let txn = MemReadTxn { trees: &*guard };
        f(&txn)
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteableTransaction) -> Result<T>,
    {
        let mut guard = self.trees.write();
        let (result, overlay) = {
            let mut txn = MemWriteTxn {
                base: &*guard,
                overlay: BTreeMap::new(),
            };
            let result = f(&mut txn);
            (result, txn.overlay)
        };
        match result {
            Ok(value) => {
                for (name, tree) in overlay {
                    match tree {
                        Some(tree) => {
                            guard.insert(name, tree);
                        }
                        None => {
                            guard.remove(&name);
                        }
                    }
                }
                Ok(value)
            }
            Err(err) => {
                trace!(error = %err, "storage.write.rollback");
                Err(err)
            }
        }
    }

    fn start_import(&self) -> Result<MemImporter<'_>> {
        Ok(MemImporter {
            trees: self.trees.write(),
        })
    }
}

struct MemReadTxn<'a> {
    trees: &'a Trees,
}

impl ReadableTransaction for MemReadTxn<'_> {
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.trees.get(tree).and_then(|t| t.get(key).cloned()))
    }

    fn open_cursor(&self, tree: &TreeName) -> Result<Box<dyn Cursor + '_>> {
        Ok(Box::new(MemCursor::new(self.trees.get(tree).map(|t| &**t))))
    }

    fn record_count(&self, tree: &TreeName) -> Result<usize> {
        Ok(self.trees.get(tree).map_or(0, |t| t.len()))
    }
}

struct MemWriteTxn<'a> {
    base: &'a Trees,
    // `None` marks a tree deleted by this transaction.
    overlay: BTreeMap<TreeName, Option<Arc<Tree>>>,
}

impl MemWriteTxn<'_> {
    fn visible(&self, tree: &TreeName) -> Option<&Tree> {
        match self.overlay.get(tree) {
            Some(staged) => staged.as_deref(),
            None => self.base.get(tree).map(|t| &**t),
        }
    }

    fn staged_mut(&mut self, tree: &TreeName) -> Result<&mut Tree> {
        if !self.overlay.contains_key(tree) {
            let current = self.base.get(tree).cloned();
            self.overlay.insert(tree.clone(), current);
        }
        match self.overlay.get_mut(tree) {
            Some(Some(staged)) => Ok(Arc::make_mut(staged)),
            _ => Err(StoreError::Storage(format!("tree {tree} is not open"))),
        }
    }
}

impl ReadableTransaction for MemWriteTxn<'_> {
    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.visible(tree).and_then(|t| t.get(key).cloned()))
    }

    fn open_cursor(&self, tree: &TreeName) -> Result<Box<dyn Cursor + '_>> {
        Ok(Box::new(MemCursor::new(self.visible(tree))))
    }

    fn record_count(&self, tree: &TreeName) -> Result<usize> {
        Ok(self.visible(tree).map_or(0, |t| t.len()))
    }
}

impl WriteableTransaction for MemWriteTxn<'_> {
    fn open_tree(&mut self, tree: &TreeName, create_on_demand: bool) -> Result<()> {
        if self.visible(tree).is_some() {
            return Ok(());
        }
        if !create_on_demand {
            return Err(StoreError::Storage(format!("tree {tree} does not exist")));
        }
        self.overlay
            .insert(tree.clone(), Some(Arc::new(Tree::new())));
        Ok(())
    }

    fn put(&mut self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()> {
        self.staged_mut(tree)?
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn update(&mut self, tree: &TreeName, key: &[u8], f: &mut UpdateFn<'_>) -> Result<bool> {
        let staged = self.staged_mut(tree)?;
        let old = staged.get(key).cloned();
        let new = f(old.as_deref())?;
        match (old, new) {
            (None, None) => Ok(false),
            (Some(old), Some(new)) if old[..] == new[..] => Ok(false),
            (_, Some(new)) => {
                staged.insert(Bytes::copy_from_slice(key), Bytes::from(new));
                Ok(true)
            }
            (Some(_), None) => {
                staged.remove(key);
                Ok(true)
            }
        }
    }

    fn delete(&mut self, tree: &TreeName, key: &[u8]) -> Result<bool> {
        if self.visible(tree).map_or(true, |t| !t.contains_key(key)) {
            return Ok(false);
        }
        Ok(self.staged_mut(tree)?.remove(key).is_some())
    }

    fn delete_tree(&mut self, tree: &TreeName) -> Result<()> {
        self.overlay.insert(tree.clone(), None);
        Ok(())
    }
}

/// Bulk loader holding exclusive access to a [`MemStorage`].
pub struct MemImporter<'a> {
    trees: RwLockWriteGuard<'a, Trees>,
}

impl Importer for MemImporter<'_> {
    fn create_tree(&mut self, tree: &TreeName) -> Result<()> {
        self.trees.insert(tree.clone(), Arc::new(Tree::new()));
        Ok(())
    }

    fn put(&mut self, tree: &TreeName, key: &[u8], value: &[u8]) -> Result<()> {
        let staged = self
            .trees
            .get_mut(tree)
            .ok_or_else(|| StoreError::Storage(format!("tree {tree} was not created")))?;
        Arc::make_mut(staged).insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn read(&self, tree: &TreeName, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.trees.get(tree).and_then(|t| t.get(key).cloned()))
    }
}

enum Position<'a> {
    Start,
    At(&'a Bytes, &'a Bytes),
    End,
}

struct MemCursor<'a> {
    tree: Option<&'a Tree>,
    pos: Position<'a>,
}

impl<'a> MemCursor<'a> {
    fn new(tree: Option<&'a Tree>) -> Self {
        Self {
            tree,
            pos: Position::Start,
        }
    }

    fn settle(&mut self, found: Option<(&'a Bytes, &'a Bytes)>, miss: Position<'a>) -> bool {
        match found {
            Some((k, v)) => {
                self.pos = Position::At(k, v);
                true
            }
            None => {
                self.pos = miss;
                false
            }
        }
    }
}

impl Cursor for MemCursor<'_> {
    fn next(&mut self) -> Result<bool> {
        let Some(tree) = self.tree else {
            return Ok(false);
        };
        let found = match self.pos {
            Position::Start => tree.iter().next(),
            Position::At(key, _) => tree
                .range::<[u8], _>((Bound::Excluded(&key[..]), Bound::Unbounded))
                .next(),
            Position::End => None,
        };
        Ok(self.settle(found, Position::End))
    }

    fn previous(&mut self) -> Result<bool> {
        let Some(tree) = self.tree else {
            return Ok(false);
        };
        let found = match self.pos {
            Position::End => tree.iter().next_back(),
            Position::At(key, _) => tree
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(&key[..])))
                .next_back(),
            Position::Start => None,
        };
        Ok(self.settle(found, Position::Start))
    }

    fn key(&self) -> Option<&[u8]> {
        match self.pos {
            Position::At(key, _) => Some(&key[..]),
            _ => None,
        }
    }

    fn value(&self) -> Option<&[u8]> {
        match self.pos {
            Position::At(_, value) => Some(&value[..]),
            _ => None,
        }
    }

    fn position_to_key(&mut self, key: &[u8]) -> Result<bool> {
        let found = self.tree.and_then(|t| t.get_key_value(key));
        Ok(self.settle(found, Position::End))
    }

    fn position_to_key_or_next(&mut self, key: &[u8]) -> Result<bool> {
        let found = self.tree.and_then(|t| {
            t.range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next()
        });
        Ok(self.settle(found, Position::End))
    }

    fn position_to_last_key(&mut self) -> Result<bool> {
        let found = self.tree.and_then(|t| t.iter().next_back());
        Ok(self.settle(found, Position::End))
    }

    fn position_to_index(&mut self, index: usize) -> Result<bool> {
        let found = self.tree.and_then(|t| t.iter().nth(index));
        Ok(self.settle(found, Position::End))
    }

    fn rank(&self) -> Result<Option<usize>> {
        let Some(tree) = self.tree else {
            return Ok(None);
        };
        Ok(match self.pos {
            Position::At(key, _) => Some(
                tree.range::<[u8], _>((Bound::Unbounded, Bound::Excluded(&key[..])))
                    .count(),
            ),
            _ => None,
        })
    }
}
