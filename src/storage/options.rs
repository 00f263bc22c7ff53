use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{Result, StoreError};

use super::metrics::BackendMetrics;

/// Default wait before a DN lock request gives up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(9);
/// Default per-context lock cache capacity.
pub const DEFAULT_LOCK_CACHE_CAPACITY: usize = 32;
/// Default number of lock table shards.
pub const DEFAULT_LOCK_TABLE_SHARDS: usize = 16;
/// Default number of IDs an index entry may hold before it degrades.
pub const DEFAULT_INDEX_ENTRY_LIMIT: usize = 4000;
/// Default number of storage shards per ID2Count counter.
pub const DEFAULT_ID2COUNT_SHARDS: usize = 4096;

/// Configuration options supplied when opening an entry container.
#[derive(Clone)]
pub struct BackendOptions {
    /// How long a DN lock request waits before returning `None`.
    pub lock_timeout: Duration,
    /// Capacity of each worker's lock cache; `0` disables caching.
    pub lock_cache_capacity: usize,
    /// Number of shards in the lock table.
    pub lock_table_shards: usize,
    /// Maximum IDs kept in one index entry before it becomes undefined.
    pub index_entry_limit: usize,
    /// Storage shards per ID2Count counter. Must be a power of two.
    pub id2count_shards: usize,
    /// Optional metrics sink.
    pub metrics: Option<Arc<dyn BackendMetrics>>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendOptions {
    /// Creates options with the default settings.
    pub fn new() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_cache_capacity: DEFAULT_LOCK_CACHE_CAPACITY,
            lock_table_shards: DEFAULT_LOCK_TABLE_SHARDS,
            index_entry_limit: DEFAULT_INDEX_ENTRY_LIMIT,
            id2count_shards: DEFAULT_ID2COUNT_SHARDS,
            metrics: None,
        }
    }

    /// Sets the lock wait timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the per-context lock cache capacity.
    pub fn lock_cache_capacity(mut self, capacity: usize) -> Self {
        self.lock_cache_capacity = capacity;
        self
    }

    /// Sets the lock table shard count.
    pub fn lock_table_shards(mut self, shards: usize) -> Self {
        self.lock_table_shards = shards;
        self
    }

    /// Sets the index entry limit.
    pub fn index_entry_limit(mut self, limit: usize) -> Self {
        self.index_entry_limit = limit;
        self
    }

    /// Sets the ID2Count shard count.
    pub fn id2count_shards(mut self, shards: usize) -> Self {
        self.id2count_shards = shards;
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn BackendMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Checks the invariants the components rely on.
    pub fn validate(&self) -> Result<()> {
        if self.lock_table_shards == 0 {
            return Err(StoreError::Config("lock_table_shards must be at least 1".into()));
        }
        if self.index_entry_limit == 0 {
            return Err(StoreError::Config("index_entry_limit must be at least 1".into()));
        }
        if !self.id2count_shards.is_power_of_two() || self.id2count_shards > 1 << 16 {
            return Err(StoreError::Config(format!(
                "id2count_shards must be a power of two no larger than 65536, got {}",
                self.id2count_shards
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendOptions")
            .field("lock_timeout", &self.lock_timeout)
            .field("lock_cache_capacity", &self.lock_cache_capacity)
            .field("lock_table_shards", &self.lock_table_shards)
            .field("index_entry_limit", &self.index_entry_limit)
            .field("id2count_shards", &self.id2count_shards)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// TOML overlay for [`BackendOptions`]. Absent keys keep their defaults.
///
/// ```toml
/// lock_timeout_ms = 2500
/// lock_cache_capacity = 64
/// index_entry_limit = 10000
/// ```
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Lock wait timeout in milliseconds.
    pub lock_timeout_ms: Option<u64>,
    /// Per-context lock cache capacity.
    pub lock_cache_capacity: Option<usize>,
    /// Lock table shard count.
    pub lock_table_shards: Option<usize>,
    /// Index entry limit.
    pub index_entry_limit: Option<usize>,
    /// ID2Count shard count.
    pub id2count_shards: Option<usize>,
}

impl BackendConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| StoreError::Config(err.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            StoreError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Overlays the configured values onto `base` and validates the result.
    pub fn apply(&self, mut base: BackendOptions) -> Result<BackendOptions> {
        if let Some(ms) = self.lock_timeout_ms {
            base.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = self.lock_cache_capacity {
            base.lock_cache_capacity = capacity;
        }
        if let Some(shards) = self.lock_table_shards {
            base.lock_table_shards = shards;
        }
        if let Some(limit) = self.index_entry_limit {
            base.index_entry_limit = limit;
        }
        if let Some(shards) = self.id2count_shards {
            base.id2count_shards = shards;
        }
        base.validate()?;
        Ok(base)
    }

    /// Shorthand for applying onto [`BackendOptions::default`].
    pub fn into_options(self) -> Result<BackendOptions> {
        self.apply(BackendOptions::default())
    }
}
