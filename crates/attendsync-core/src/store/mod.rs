//! Local persistence for offline data access.
//!
//! Both caches sit on a [`KeyedStore`]: an ordered string-keyed store with
//! point lookup, prefix (index) scan and range delete. Two backends ship:
//!
//! - [`MemoryStore`]: process-lifetime map, used by tests and as a scratch tier
//! - [`JsonFileStore`]: one JSON document per store under the cache directory
//!
//! On top of the raw store:
//!
//! - [`LocalAggregateStore`]: monthly aggregates, serialized per key
//! - [`EphemeralTodayCache`]: same-day events with per-kind expiry

pub mod aggregate;
pub mod file;
pub mod memory;
pub mod today;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

pub use aggregate::{AggregatePair, LocalAggregateStore};
pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use today::{spawn_expiry_sweeper, EphemeralTodayCache};

/// Values a [`KeyedStore`] can hold.
pub trait StoredValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> StoredValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Ordered keyed store. Keys compare bytewise, so a shared prefix groups
/// related records and a key range selects a contiguous slice.
pub trait KeyedStore<V: StoredValue>: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<V>>;

    fn put(&self, key: &str, value: V) -> Result<()>;

    /// Write several entries as one batch.
    fn put_many(&self, entries: Vec<(String, V)>) -> Result<()>;

    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, V)>>;

    /// Delete every key in `[start, end)`. Returns how many were removed.
    fn delete_range(&self, start: &str, end: &str) -> Result<usize>;

    /// Remove all of the given keys as one batch. Returns how many existed.
    fn remove_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.remove(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
