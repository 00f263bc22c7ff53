//! Sharded per-subtree entry counters.
//!
//! A counter for entry `id` is spread over up to `shards` storage records keyed
//! `id (8 bytes BE) || shard (2 bytes BE)`. Each thread always writes the same
//! shard, so concurrent transactions bumping one hot counter (the base entry's
//! child count, say) touch different keys. Reads sum every shard with a prefix
//! scan. The grand total lives under the reserved id [`TOTAL_COUNT_ID`] and is
//! sharded the same way.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::primitives::bytes::{ord, var};
use crate::storage::tree::{Importer, ReadableTransaction, TreeName, WriteableTransaction};
use crate::types::{EntryId, Result, StoreError};

/// Reserved counter id holding the total of all other counters.
pub const TOTAL_COUNT_ID: u64 = u64::MAX;

const KEY_LEN: usize = 10;

static NEXT_SHARD: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_SHARD: Cell<Option<u64>> = const { Cell::new(None) };
}

fn thread_shard() -> u64 {
    THREAD_SHARD.with(|slot| match slot.get() {
        Some(shard) => shard,
        None => {
            let shard = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(shard));
            shard
        }
    })
}

/// Sharded delta counter stored in one tree.
#[derive(Clone, Debug)]
pub struct Id2Count {
    tree: TreeName,
    shard_mask: u64,
}

impl Id2Count {
    /// Creates a counter over `tree` using `shards` records per id.
    pub fn new(tree: TreeName, shards: usize) -> Result<Self> {
        if !shards.is_power_of_two() || shards > 1 << 16 {
            return Err(StoreError::Invalid(
                "id2count shard count must be a power of two up to 65536",
            ));
        }
        Ok(Self {
            tree,
            shard_mask: shards as u64 - 1,
        })
    }

    /// Backing tree.
    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    /// Opens the backing tree.
    pub fn open<T>(&self, txn: &mut T, create_on_demand: bool) -> Result<()>
    where
        T: WriteableTransaction + ?Sized,
    {
        txn.open_tree(&self.tree, create_on_demand)
    }

    /// Adds `delta` to the counter for `id` and to the total.
    pub fn add_delta<T>(&self, txn: &mut T, id: EntryId, delta: i64) -> Result<()>
    where
        T: WriteableTransaction + ?Sized,
    {
        if id.get() == TOTAL_COUNT_ID {
            return Err(StoreError::Invalid("entry id collides with the total counter"));
        }
        if delta == 0 {
            return Ok(());
        }
        let shard = thread_shard() & self.shard_mask;
        self.add_to_shard(txn, id.get(), shard, delta)?;
        self.add_to_shard(txn, TOTAL_COUNT_ID, shard, delta)
    }

    /// Current count for `id`; `0` when nothing was ever recorded.
    pub fn get_count<T>(&self, txn: &T, id: EntryId) -> Result<i64>
    where
        T: ReadableTransaction + ?Sized,
    {
        Ok(self.scan(txn, id.get(), false)?.0)
    }

    /// Sum of every counter.
    pub fn get_total_count<T>(&self, txn: &T) -> Result<i64>
    where
        T: ReadableTransaction + ?Sized,
    {
        Ok(self.scan(txn, TOTAL_COUNT_ID, false)?.0)
    }

    /// Removes the counter for `id`, subtracting its value from the total.
    /// Returns the removed value.
    pub fn delete_count<T>(&self, txn: &mut T, id: EntryId) -> Result<i64>
    where
        T: WriteableTransaction + ?Sized,
    {
        if id.get() == TOTAL_COUNT_ID {
            return Err(StoreError::Invalid("the total counter cannot be deleted"));
        }
        let (value, keys) = self.scan(&*txn, id.get(), true)?;
        for key in &keys {
            txn.delete(&self.tree, key)?;
        }
        if value != 0 {
            let shard = thread_shard() & self.shard_mask;
            self.add_to_shard(txn, TOTAL_COUNT_ID, shard, -value)?;
        }
        trace!(tree = %self.tree, id = id.get(), value, "id2count.delete");
        Ok(value)
    }

    /// Writes a counter during a bulk import. The total is written separately
    /// with [`Id2Count::import_put_total_count`].
    pub fn import_put<I>(&self, importer: &mut I, id: EntryId, count: i64) -> Result<()>
    where
        I: Importer + ?Sized,
    {
        if id.get() == TOTAL_COUNT_ID {
            return Err(StoreError::Invalid("entry id collides with the total counter"));
        }
        self.import_raw(importer, id.get(), count)
    }

    /// Writes the total during a bulk import.
    pub fn import_put_total_count<I>(&self, importer: &mut I, total: i64) -> Result<()>
    where
        I: Importer + ?Sized,
    {
        self.import_raw(importer, TOTAL_COUNT_ID, total)
    }

    fn import_raw<I>(&self, importer: &mut I, id: u64, count: i64) -> Result<()>
    where
        I: Importer + ?Sized,
    {
        if count == 0 {
            return Ok(());
        }
        let mut value = Vec::with_capacity(10);
        var::encode_i64(count, &mut value);
        importer.put(&self.tree, &make_key(id, 0), &value)
    }

    fn add_to_shard<T>(&self, txn: &mut T, id: u64, shard: u64, delta: i64) -> Result<()>
    where
        T: WriteableTransaction + ?Sized,
    {
        let key = make_key(id, shard);
        let mut apply = |old: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
            let current = match old {
                Some(bytes) => var::decode_i64_exact(bytes)?,
                None => 0,
            };
            let next = current
                .checked_add(delta)
                .ok_or(StoreError::Invalid("id2count overflow"))?;
            if next == 0 {
                return Ok(None);
            }
            let mut value = Vec::with_capacity(10);
            var::encode_i64(next, &mut value);
            Ok(Some(value))
        };
        txn.update(&self.tree, &key, &mut apply)?;
        Ok(())
    }

    /// Sums every shard of `id`, optionally collecting the shard keys.
    fn scan<T>(&self, txn: &T, id: u64, collect: bool) -> Result<(i64, Vec<Vec<u8>>)>
    where
        T: ReadableTransaction + ?Sized,
    {
        let mut prefix = Vec::with_capacity(8);
        ord::put_u64_be(&mut prefix, id);
        let mut cursor = txn.open_cursor(&self.tree)?;
        let mut total = 0i64;
        let mut keys = Vec::new();
        let mut found = cursor.position_to_key_or_next(&prefix)?;
        while found {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() != KEY_LEN {
                return Err(StoreError::Corruption("id2count key has the wrong length"));
            }
            total = total
                .checked_add(var::decode_i64_exact(value)?)
                .ok_or(StoreError::Corruption("id2count sum overflows"))?;
            if collect {
                keys.push(key.to_vec());
            }
            found = cursor.next()?;
        }
        Ok((total, keys))
    }
}

fn make_key(id: u64, shard: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    ord::put_u64_be(&mut key, id);
    ord::put_u16_be(&mut key, shard as u16);
    key
}
