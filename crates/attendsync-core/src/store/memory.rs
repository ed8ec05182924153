use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::Result;
use parking_lot::RwLock;

use super::{KeyedStore, StoredValue};

/// In-memory ordered store.
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: RwLock<BTreeMap<String, V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V: StoredValue> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, V>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.entries.read().clone()
    }
}

/// Keys in `[start, end)`; an empty `end` means unbounded.
pub(crate) fn keys_in_range<V>(map: &BTreeMap<String, V>, start: &str, end: &str) -> Vec<String> {
    if !end.is_empty() && start > end {
        return Vec::new();
    }
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_string())
    };
    map.range((Bound::Included(start.to_string()), upper))
        .map(|(k, _)| k.clone())
        .collect()
}

pub(crate) fn scan<V: Clone>(map: &BTreeMap<String, V>, prefix: &str) -> Vec<(String, V)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl<V: StoredValue> KeyedStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn put_many(&self, entries: Vec<(String, V)>) -> Result<()> {
        let mut map = self.entries.write();
        map.extend(entries);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, V)>> {
        Ok(scan(&*self.entries.read(), prefix))
    }

    fn delete_range(&self, start: &str, end: &str) -> Result<usize> {
        let mut map = self.entries.write();
        let doomed = keys_in_range(&*map, start, end);
        for key in &doomed {
            map.remove(key);
        }
        Ok(doomed.len())
    }

    fn remove_many(&self, keys: &[String]) -> Result<usize> {
        let mut map = self.entries.write();
        Ok(keys.iter().filter(|k| map.remove(k.as_str()).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryStore<u32> {
        let store = MemoryStore::new();
        for (i, key) in ["a/1", "a/2", "ab/1", "b/1", "c/9"].iter().enumerate() {
            store.put(key, i as u32).unwrap();
        }
        store
    }

    #[test]
    fn test_point_lookup() {
        let store = seeded();
        assert_eq!(store.get("a/2").unwrap(), Some(1));
        assert_eq!(store.get("zzz").unwrap(), None);
    }

    #[test]
    fn test_prefix_scan_is_exact() {
        let store = seeded();
        let keys: Vec<String> = store
            .scan_prefix("a/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(store.scan_prefix("").unwrap().len(), 5);
    }

    #[test]
    fn test_delete_range_half_open() {
        let store = seeded();
        assert_eq!(store.delete_range("", "b/1").unwrap(), 3);
        assert_eq!(store.get("b/1").unwrap(), Some(3));
        assert_eq!(store.len(), 2);
        // Idempotent
        assert_eq!(store.delete_range("", "b/1").unwrap(), 0);
    }

    #[test]
    fn test_remove_many_counts_existing() {
        let store = seeded();
        let removed = store
            .remove_many(&["a/1".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.remove("a/1").unwrap());
    }
}
