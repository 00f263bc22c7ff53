use std::sync::Arc;

use tracing::{debug, trace};

use crate::storage::metrics::BackendMetrics;
use crate::storage::tree::{ReadableTransaction, TreeName, WriteableTransaction};
use crate::types::{EntryId, Result};

use super::entry_id_set::EntryIdSet;

/// Equality index for one attribute: normalized value to [`EntryIdSet`].
///
/// Once an entry's set grows past the entry limit it is stored undefined and
/// never returns to an explicit list; later inserts and removals only move its
/// size hint.
#[derive(Clone)]
pub struct AttributeIndex {
    attribute: String,
    tree: TreeName,
    entry_limit: usize,
    metrics: Arc<dyn BackendMetrics>,
}

impl AttributeIndex {
    /// Creates the equality index for `attribute` under `base_dn`.
    pub fn new(
        base_dn: &str,
        attribute: &str,
        entry_limit: usize,
        metrics: Arc<dyn BackendMetrics>,
    ) -> Self {
        let attribute = attribute.trim().to_lowercase();
        Self {
            tree: TreeName::new(base_dn, format!("{attribute}.equality")),
            attribute,
            entry_limit,
            metrics,
        }
    }

    /// Indexed attribute type, lower-cased.
    pub fn attribute(&self) -> &str {
        &self.attribute
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

    /// Index key for an attribute value.
    pub fn key_for(value: &str) -> Vec<u8> {
        value.trim().to_lowercase().into_bytes()
    }

    /// Records that entry `id` holds `value`. Returns whether the stored set
    /// changed.
    pub fn insert<T>(&self, txn: &mut T, value: &str, id: EntryId) -> Result<bool>
    where
        T: WriteableTransaction + ?Sized,
    {
        let key = Self::key_for(value);
        let mut changed = false;
        let mut apply = |old: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
            let mut set = match old {
                Some(bytes) => EntryIdSet::new_set_from_bytes(&key, bytes)?,
                None => EntryIdSet::empty(),
            };
            changed = set.add(id);
            if set.apply_entry_limit(&key, self.entry_limit) {
                debug!(tree = %self.tree, size = set.size(), "index entry exceeded the entry limit");
                self.metrics.index_entry_degraded(&self.attribute);
            }
            Ok(Some(set.to_byte_string().to_vec()))
        };
        txn.update(&self.tree, &key, &mut apply)?;
        Ok(changed)
    }

    /// Records that entry `id` no longer holds `value`.
    pub fn remove<T>(&self, txn: &mut T, value: &str, id: EntryId) -> Result<bool>
    where
        T: WriteableTransaction + ?Sized,
    {
        let key = Self::key_for(value);
        let mut changed = false;
        let mut apply = |old: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
            let Some(bytes) = old else {
                return Ok(None);
            };
            let mut set = EntryIdSet::new_set_from_bytes(&key, bytes)?;
            changed = set.remove(id);
            if set.is_defined() && set.is_empty() {
                return Ok(None);
            }
            Ok(Some(set.to_byte_string().to_vec()))
        };
        txn.update(&self.tree, &key, &mut apply)?;
        Ok(changed)
    }

    /// Entries holding `value`. Absent keys yield an empty defined set.
    pub fn lookup<T>(&self, txn: &T, value: &str) -> Result<EntryIdSet>
    where
        T: ReadableTransaction + ?Sized,
    {
        let key = Self::key_for(value);
        let set = match txn.read(&self.tree, &key)? {
            Some(bytes) => EntryIdSet::new_set_from_bytes(&key, &bytes)?,
            None => EntryIdSet::empty(),
        };
        trace!(tree = %self.tree, %set, "index lookup");
        Ok(set)
    }
}
