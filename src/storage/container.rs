//! Entry container: one base DN's entries, indexes and counters, kept
//! consistent under DN locks.
//!
//! Every mutation takes its DN locks first (read on the parent, write on the
//! entry, or write on a whole subtree), runs exactly one storage write
//! transaction, and drops the locks when it returns, whether the transaction
//! committed or not.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::primitives::concurrency::{DnLock, LockContext, LockManager, LockType};
use crate::types::{Dn, EntryId, Result, StoreError};

use super::entry::{EntryRecord, Modification};
use super::index::vlv::{SearchScope, SortOrder, UnindexedVlv, VlvIndex, VlvIndexConfig, VlvResult};
use super::index::{AttributeIndex, EntryIdSet, Id2Count};
use super::metrics::{default_metrics, BackendMetrics};
use super::options::BackendOptions;
use super::tree::{Importer, ReadableTransaction, Storage, TreeName, WriteableTransaction};

/// Indexes maintained by a container.
#[derive(Clone, Debug, Default)]
pub struct IndexConfig {
    /// Attributes with an equality index.
    pub equality: Vec<String>,
    /// VLV index definitions.
    pub vlv: Vec<VlvIndexConfig>,
}

impl IndexConfig {
    /// Adds an equality index.
    pub fn equality(mut self, attribute: &str) -> Self {
        self.equality.push(attribute.to_string());
        self
    }

    /// Adds a VLV index.
    pub fn vlv(mut self, config: VlvIndexConfig) -> Self {
        self.vlv.push(config);
        self
    }
}

/// A sorted search as seen by the VLV paths: base, scope and sort order.
#[derive(Clone, Debug)]
pub struct SortedSearch {
    /// Search base.
    pub base_dn: Dn,
    /// Search scope.
    pub scope: SearchScope,
    /// Requested sort order.
    pub sort_order: SortOrder,
}

/// Entries, indexes and counters stored beneath one base DN.
pub struct EntryContainer<S: Storage> {
    storage: S,
    base_dn: Dn,
    locks: LockManager,
    metrics: Arc<dyn BackendMetrics>,
    dn2id: TreeName,
    id2entry: TreeName,
    id2childcount: Id2Count,
    equality: Vec<AttributeIndex>,
    vlv: Vec<VlvIndex>,
    entry_limit: usize,
    next_id: AtomicU64,
}

impl<S: Storage> EntryContainer<S> {
    /// Opens (creating on demand) the container rooted at `base_dn`.
    pub fn open(storage: S, base_dn: Dn, options: BackendOptions, indexes: IndexConfig) -> Result<Self> {
        options.validate()?;
        let base = base_dn.to_string();
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        let dn2id = TreeName::new(base.clone(), "dn2id");
        let id2entry = TreeName::new(base.clone(), "id2entry");
        let id2childcount =
            Id2Count::new(TreeName::new(base.clone(), "id2childcount"), options.id2count_shards)?;
        let equality: Vec<AttributeIndex> = indexes
            .equality
            .iter()
            .map(|attr| {
                AttributeIndex::new(&base, attr, options.index_entry_limit, Arc::clone(&metrics))
            })
            .collect();
        let vlv: Vec<VlvIndex> = indexes
            .vlv
            .into_iter()
            .map(|config| VlvIndex::new(&base_dn, config, Arc::clone(&metrics)))
            .collect();

        let last_id = storage.write(|txn| {
            txn.open_tree(&dn2id, true)?;
            txn.open_tree(&id2entry, true)?;
            id2childcount.open(txn, true)?;
            for index in &equality {
                index.open(txn, true)?;
            }
            for index in &vlv {
                index.open(txn, true)?;
            }
            last_entry_id(&*txn, &id2entry)
        })?;
        info!(
            base = %base_dn,
            next_id = last_id + 1,
            equality = equality.len(),
            vlv = vlv.len(),
            "entry container opened"
        );
        Ok(Self {
            storage,
            locks: LockManager::new(&options),
            base_dn,
            metrics,
            dn2id,
            id2entry,
            id2childcount,
            equality,
            vlv,
            entry_limit: options.index_entry_limit,
            next_id: AtomicU64::new(last_id + 1),
        })
    }

    /// Base DN of the container.
    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Lock manager guarding this container.
    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Creates a lock context for one worker.
    pub fn lock_context(&self) -> LockContext {
        self.locks.context()
    }

    /// Adds `entry`. Its parent must exist unless it is the base entry.
    pub fn add_entry(&self, ctx: &mut LockContext, entry: EntryRecord) -> Result<EntryId> {
        let dn = entry.dn().clone();
        let parent = self.parent_in_container(&dn)?;
        let _parent_lock = self.lock_parent(ctx, parent.as_ref())?;
        let _entry_lock = self.lock(ctx, &dn, LockType::WriteEntry)?;
        let id = self.allocate_id()?;
        self.storage.write(|txn| {
            let key = dn.to_key();
            if txn.read(&self.dn2id, &key)?.is_some() {
                return Err(StoreError::EntryAlreadyExists(dn.to_string()));
            }
            let parent_id = match &parent {
                Some(parent) => Some(self.require_id(&*txn, parent)?),
                None => None,
            };
            txn.put(&self.dn2id, &key, &id.to_be_bytes())?;
            txn.put(&self.id2entry, &id.to_be_bytes(), &entry.encode())?;
            if let Some(parent_id) = parent_id {
                self.id2childcount.add_delta(txn, parent_id, 1)?;
            }
            self.index_entry(txn, id, &entry, true)
        })?;
        debug!(%dn, %id, "entry added");
        Ok(id)
    }

    /// Deletes a leaf entry.
    pub fn delete_entry(&self, ctx: &mut LockContext, dn: &Dn) -> Result<()> {
        let parent = self.parent_in_container(dn)?;
        let _parent_lock = self.lock_parent(ctx, parent.as_ref())?;
        let _entry_lock = self.lock(ctx, dn, LockType::WriteEntry)?;
        self.storage.write(|txn| {
            let id = self.require_id(&*txn, dn)?;
            if self.id2childcount.get_count(&*txn, id)? > 0 {
                return Err(StoreError::NotAllowedOnNonLeaf(dn.to_string()));
            }
            let entry = self.require_entry(&*txn, id)?;
            self.remove_records(txn, id, &entry)?;
            if let Some(parent) = &parent {
                let parent_id = self.require_id(&*txn, parent)?;
                self.id2childcount.add_delta(txn, parent_id, -1)?;
            }
            Ok(())
        })?;
        debug!(%dn, "entry deleted");
        Ok(())
    }

    /// Deletes `dn` and every entry beneath it. Returns how many were removed.
    pub fn delete_subtree(&self, ctx: &mut LockContext, dn: &Dn) -> Result<u64> {
        let parent = self.parent_in_container(dn)?;
        let _parent_lock = self.lock_parent(ctx, parent.as_ref())?;
        let _subtree_lock = self.lock(ctx, dn, LockType::WriteSubtree)?;
        let removed = self.storage.write(|txn| {
            let ids = self.subtree_ids(&*txn, dn)?;
            if ids.is_empty() {
                return Err(StoreError::NoSuchEntry(dn.to_string()));
            }
            for id in &ids {
                let entry = self.require_entry(&*txn, *id)?;
                self.remove_records(txn, *id, &entry)?;
            }
            if let Some(parent) = &parent {
                let parent_id = self.require_id(&*txn, parent)?;
                self.id2childcount.add_delta(txn, parent_id, -1)?;
            }
            Ok(ids.len() as u64)
        })?;
        debug!(%dn, removed, "subtree deleted");
        Ok(removed)
    }

    /// Applies `modifications` to the entry at `dn`, updating only the index
    /// records whose keys changed.
    pub fn modify_entry(
        &self,
        ctx: &mut LockContext,
        dn: &Dn,
        modifications: &[Modification],
    ) -> Result<()> {
        self.check_in_base(dn)?;
        let _entry_lock = self.lock(ctx, dn, LockType::WriteEntry)?;
        self.storage.write(|txn| {
            let id = self.require_id(&*txn, dn)?;
            let old = self.require_entry(&*txn, id)?;
            let mut new = old.clone();
            for modification in modifications {
                new.apply(modification);
            }
            if new == old {
                return Ok(());
            }
            txn.put(&self.id2entry, &id.to_be_bytes(), &new.encode())?;
            for index in &self.equality {
                let old_values = old.values(index.attribute());
                let new_values = new.values(index.attribute());
                let old_keys: BTreeSet<Vec<u8>> =
                    old_values.iter().map(|v| AttributeIndex::key_for(v)).collect();
                let new_keys: BTreeSet<Vec<u8>> =
                    new_values.iter().map(|v| AttributeIndex::key_for(v)).collect();
                for value in old_values {
                    if !new_keys.contains(&AttributeIndex::key_for(value)) {
                        index.remove(txn, value, id)?;
                    }
                }
                for value in new_values {
                    if !old_keys.contains(&AttributeIndex::key_for(value)) {
                        index.insert(txn, value, id)?;
                    }
                }
            }
            for index in &self.vlv {
                let order = &index.config().sort_order;
                index.modify_entry(txn, dn, &old.sort_values(id, order), &new.sort_values(id, order))?;
            }
            Ok(())
        })?;
        debug!(%dn, changes = modifications.len(), "entry modified");
        Ok(())
    }

    /// Reads an entry under a read lock.
    pub fn get_entry(&self, ctx: &mut LockContext, dn: &Dn) -> Result<Option<EntryRecord>> {
        let _lock = self.lock(ctx, dn, LockType::ReadEntry)?;
        self.storage.read(|txn| match self.lookup_id(txn, dn)? {
            Some(id) => self.require_entry(txn, id).map(Some),
            None => Ok(None),
        })
    }

    /// ID of the entry at `dn`, if present.
    pub fn get_entry_id(&self, dn: &Dn) -> Result<Option<EntryId>> {
        self.storage.read(|txn| self.lookup_id(txn, dn))
    }

    /// Number of immediate children of `dn`.
    pub fn number_of_children(&self, dn: &Dn) -> Result<i64> {
        self.storage.read(|txn| {
            let id = self.require_id(txn, dn)?;
            self.id2childcount.get_count(txn, id)
        })
    }

    /// Number of entries in the container, base entry included.
    pub fn number_of_entries(&self) -> Result<i64> {
        self.storage.read(|txn| {
            let below_base = self.id2childcount.get_total_count(txn)?;
            let base = i64::from(self.lookup_id(txn, &self.base_dn)?.is_some());
            Ok(below_base + base)
        })
    }

    /// Entries whose `attribute` equals `value`. Unindexed attributes yield an
    /// undefined set of unknown size.
    pub fn search_equality(&self, attribute: &str, value: &str) -> Result<EntryIdSet> {
        let attribute = attribute.to_lowercase();
        let Some(index) = self.equality.iter().find(|i| i.attribute() == attribute) else {
            return Ok(EntryIdSet::new_undefined_set());
        };
        self.storage.read(|txn| index.lookup(txn, value))
    }

    /// VLV window by 1-based offset, served by a matching VLV index when one
    /// exists and by sorting the candidates otherwise.
    pub fn vlv_by_offset(
        &self,
        search: &SortedSearch,
        before: usize,
        after: usize,
        offset: i64,
    ) -> Result<VlvResult> {
        self.storage.read(|txn| match self.find_vlv(search) {
            Some(index) => index.vlv_by_offset(txn, before, after, offset),
            None => Ok(self.unindexed(txn, search)?.by_offset(before, after, offset)),
        })
    }

    /// VLV window around the first entry at or after `assertion`.
    pub fn vlv_by_assertion(
        &self,
        search: &SortedSearch,
        before: usize,
        after: usize,
        assertion: &str,
    ) -> Result<VlvResult> {
        self.storage.read(|txn| match self.find_vlv(search) {
            Some(index) => index.vlv_by_assertion(txn, before, after, assertion),
            None => Ok(self.unindexed(txn, search)?.by_assertion(before, after, assertion)),
        })
    }

    /// Replaces the container contents with `entries` through the bulk-load
    /// path. Parents must precede their children. No other operation may run
    /// concurrently. Returns the number of imported entries.
    pub fn import_entries<I>(&self, entries: I) -> Result<u64>
    where
        I: IntoIterator<Item = EntryRecord>,
    {
        let mut importer = self.storage.start_import()?;
        importer.create_tree(&self.dn2id)?;
        importer.create_tree(&self.id2entry)?;
        importer.create_tree(self.id2childcount.tree())?;
        for index in &self.equality {
            importer.create_tree(index.tree())?;
        }
        for index in &self.vlv {
            importer.create_tree(index.tree())?;
        }

        let mut next = 1u64;
        let mut children: BTreeMap<EntryId, i64> = BTreeMap::new();
        let mut postings: BTreeMap<(usize, Vec<u8>), EntryIdSet> = BTreeMap::new();
        for entry in entries {
            let dn = entry.dn().clone();
            let parent = self.parent_in_container(&dn)?;
            let key = dn.to_key();
            if importer.read(&self.dn2id, &key)?.is_some() {
                return Err(StoreError::EntryAlreadyExists(dn.to_string()));
            }
            if let Some(parent) = parent {
                let parent_id = importer
                    .read(&self.dn2id, &parent.to_key())?
                    .ok_or_else(|| StoreError::NoSuchEntry(parent.to_string()))
                    .and_then(|raw| EntryId::from_be_slice(&raw))?;
                *children.entry(parent_id).or_default() += 1;
            }
            let id = EntryId::new(next)?;
            next += 1;
            importer.put(&self.dn2id, &key, &id.to_be_bytes())?;
            importer.put(&self.id2entry, &id.to_be_bytes(), &entry.encode())?;
            for (slot, index) in self.equality.iter().enumerate() {
                for value in entry.values(index.attribute()) {
                    postings
                        .entry((slot, AttributeIndex::key_for(value)))
                        .or_default()
                        .add(id);
                }
            }
            for index in &self.vlv {
                if index.should_include(&dn) {
                    let values = entry.sort_values(id, &index.config().sort_order);
                    index.import_put(&mut importer, &values)?;
                }
            }
        }

        for ((slot, key), mut set) in postings {
            let index = &self.equality[slot];
            if set.apply_entry_limit(&key, self.entry_limit) {
                self.metrics.index_entry_degraded(index.attribute());
            }
            importer.put(index.tree(), &key, &set.to_byte_string())?;
        }
        let mut total = 0i64;
        for (parent_id, count) in children {
            self.id2childcount.import_put(&mut importer, parent_id, count)?;
            total += count;
        }
        self.id2childcount.import_put_total_count(&mut importer, total)?;
        drop(importer);

        self.next_id.store(next, Ordering::SeqCst);
        let imported = next - 1;
        info!(base = %self.base_dn, imported, "import finished");
        Ok(imported)
    }

    fn lock(&self, ctx: &mut LockContext, dn: &Dn, kind: LockType) -> Result<DnLock> {
        self.locks
            .try_lock(ctx, dn, kind, self.locks.timeout())
            .ok_or_else(|| {
                warn!(%dn, %kind, "dn lock not acquired, rejecting operation");
                StoreError::Busy(format!("could not acquire a {kind} lock on {dn}"))
            })
    }

    fn lock_parent(&self, ctx: &mut LockContext, parent: Option<&Dn>) -> Result<Option<DnLock>> {
        parent
            .map(|parent| self.lock(ctx, parent, LockType::ReadEntry))
            .transpose()
    }

    fn check_in_base(&self, dn: &Dn) -> Result<()> {
        if dn.is_in_subtree_of(&self.base_dn) {
            Ok(())
        } else {
            Err(StoreError::InvalidDn(format!(
                "{dn} is not within {}",
                self.base_dn
            )))
        }
    }

    /// Parent of `dn` when `dn` lies strictly beneath the base entry.
    fn parent_in_container(&self, dn: &Dn) -> Result<Option<Dn>> {
        self.check_in_base(dn)?;
        if *dn == self.base_dn {
            return Ok(None);
        }
        Ok(dn.parent())
    }

    fn allocate_id(&self) -> Result<EntryId> {
        let raw = self.next_id.fetch_add(1, Ordering::SeqCst);
        if raw > EntryId::MAX.get() {
            return Err(StoreError::Invalid("entry id space exhausted"));
        }
        Ok(EntryId(raw))
    }

    fn lookup_id<T>(&self, txn: &T, dn: &Dn) -> Result<Option<EntryId>>
    where
        T: ReadableTransaction + ?Sized,
    {
        txn.read(&self.dn2id, &dn.to_key())?
            .map(|raw| EntryId::from_be_slice(&raw))
            .transpose()
    }

    fn require_id<T>(&self, txn: &T, dn: &Dn) -> Result<EntryId>
    where
        T: ReadableTransaction + ?Sized,
    {
        self.lookup_id(txn, dn)?
            .ok_or_else(|| StoreError::NoSuchEntry(dn.to_string()))
    }

    fn require_entry<T>(&self, txn: &T, id: EntryId) -> Result<EntryRecord>
    where
        T: ReadableTransaction + ?Sized,
    {
        let raw = txn
            .read(&self.id2entry, &id.to_be_bytes())?
            .ok_or(StoreError::Corruption("dn2id references a missing entry"))?;
        EntryRecord::decode(&raw)
    }

    /// IDs of `dn` and every entry beneath it, in dn2id key order.
    fn subtree_ids<T>(&self, txn: &T, dn: &Dn) -> Result<Vec<EntryId>>
    where
        T: ReadableTransaction + ?Sized,
    {
        let prefix = dn.to_key();
        let mut cursor = txn.open_cursor(&self.dn2id)?;
        let mut ids = Vec::new();
        let mut found = cursor.position_to_key_or_next(&prefix)?;
        while found {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(EntryId::from_be_slice(value)?);
            found = cursor.next()?;
        }
        Ok(ids)
    }

    fn remove_records(
        &self,
        txn: &mut dyn WriteableTransaction,
        id: EntryId,
        entry: &EntryRecord,
    ) -> Result<()> {
        txn.delete(&self.dn2id, &entry.dn().to_key())?;
        txn.delete(&self.id2entry, &id.to_be_bytes())?;
        self.id2childcount.delete_count(txn, id)?;
        self.index_entry(txn, id, entry, false)
    }

    fn index_entry(
        &self,
        txn: &mut dyn WriteableTransaction,
        id: EntryId,
        entry: &EntryRecord,
        adding: bool,
    ) -> Result<()> {
        for index in &self.equality {
            for value in entry.values(index.attribute()) {
                if adding {
                    index.insert(txn, value, id)?;
                } else {
                    index.remove(txn, value, id)?;
                }
            }
        }
        for index in &self.vlv {
            let values = entry.sort_values(id, &index.config().sort_order);
            if adding {
                index.add_entry(txn, entry.dn(), &values)?;
            } else {
                index.remove_entry(txn, entry.dn(), &values)?;
            }
        }
        Ok(())
    }

    fn find_vlv(&self, search: &SortedSearch) -> Option<&VlvIndex> {
        self.vlv.iter().find(|index| {
            let config = index.config();
            config.base_dn == search.base_dn
                && config.scope == search.scope
                && config.sort_order == search.sort_order
        })
    }

    fn unindexed(&self, txn: &dyn ReadableTransaction, search: &SortedSearch) -> Result<UnindexedVlv> {
        self.metrics.vlv_request(false);
        let mut candidates = Vec::new();
        for id in self.subtree_ids(txn, &search.base_dn)? {
            let entry = self.require_entry(txn, id)?;
            if search.scope.should_include(&search.base_dn, entry.dn()) {
                candidates.push(entry.sort_values(id, &search.sort_order));
            }
        }
        UnindexedVlv::new(search.sort_order.clone(), candidates)
    }
}

fn last_entry_id(txn: &dyn WriteableTransaction, id2entry: &TreeName) -> Result<u64> {
    let mut cursor = txn.open_cursor(id2entry)?;
    if !cursor.position_to_last_key()? {
        return Ok(0);
    }
    match cursor.key() {
        Some(key) => Ok(EntryId::from_be_slice(key)?.get()),
        None => Ok(0),
    }
}
