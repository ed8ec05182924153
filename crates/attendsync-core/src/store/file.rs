use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::memory::{keys_in_range, scan};
use super::{KeyedStore, StoredValue};

/// Format version written into every store document.
const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct StoreDocument<V> {
    version: u32,
    entries: BTreeMap<String, V>,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a, V> {
    version: u32,
    entries: &'a BTreeMap<String, V>,
}

/// Keyed store persisted as a single JSON document.
///
/// The whole map is kept in memory and rewritten on every mutation through
/// a temp file plus rename, so a crash leaves either the old or the new
/// document on disk, never a torn one.
pub struct JsonFileStore<V> {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V: StoredValue> JsonFileStore<V> {
    /// Open (or create) the store `name` inside `cache_dir`.
    pub fn open(cache_dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;
        let path = cache_dir.join(format!("{}.json", name));
        let entries = Self::load(&path)?;
        debug!(store = name, entries = entries.len(), "Opened keyed store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, V>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store file: {}", path.display()))?;

        let doc: StoreDocument<V> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store file: {}", path.display()))?;

        if doc.version != STORE_FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported store format version {} in {}",
                doc.version,
                path.display()
            );
        }
        Ok(doc.entries)
    }

    fn persist(&self, entries: &BTreeMap<String, V>) -> Result<()> {
        let doc = StoreDocumentRef {
            version: STORE_FORMAT_VERSION,
            entries,
        };
        let contents = serde_json::to_string_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write store file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace store file: {}", self.path.display()))?;
        Ok(())
    }

    /// Apply `mutate` and persist when it reports a change. On a failed
    /// write the in-memory map is rolled back.
    fn mutate<R>(&self, mutate: impl FnOnce(&mut BTreeMap<String, V>) -> (R, bool)) -> Result<R> {
        let mut entries = self.entries.lock();
        let before = entries.clone();
        let (result, changed) = mutate(&mut *entries);
        if changed {
            if let Err(e) = self.persist(&*entries) {
                *entries = before;
                return Err(e);
            }
        }
        Ok(result)
    }
}

impl<V: StoredValue> KeyedStore<V> for JsonFileStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        self.mutate(|map| {
            map.insert(key.to_string(), value);
            ((), true)
        })
    }

    fn put_many(&self, entries: Vec<(String, V)>) -> Result<()> {
        let changed = !entries.is_empty();
        self.mutate(|map| {
            map.extend(entries);
            ((), changed)
        })
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.mutate(|map| {
            let existed = map.remove(key).is_some();
            (existed, existed)
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, V)>> {
        Ok(scan(&*self.entries.lock(), prefix))
    }

    fn delete_range(&self, start: &str, end: &str) -> Result<usize> {
        self.mutate(|map| {
            let doomed = keys_in_range(map, start, end);
            for key in &doomed {
                map.remove(key);
            }
            (doomed.len(), !doomed.is_empty())
        })
    }

    fn remove_many(&self, keys: &[String]) -> Result<usize> {
        self.mutate(|map| {
            let removed = keys.iter().filter(|k| map.remove(k.as_str()).is_some()).count();
            (removed, removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: JsonFileStore<String> = JsonFileStore::open(dir.path(), "notes").unwrap();
            store.put("k/1", "one".to_string()).unwrap();
            store.put("k/2", "two".to_string()).unwrap();
            assert!(store.remove("k/1").unwrap());
        }
        let reopened: JsonFileStore<String> = JsonFileStore::open(dir.path(), "notes").unwrap();
        assert_eq!(reopened.get("k/1").unwrap(), None);
        assert_eq!(reopened.get("k/2").unwrap(), Some("two".to_string()));
        assert!(!reopened.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_range_delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<u32> = JsonFileStore::open(dir.path(), "events").unwrap();
        store
            .put_many(vec![
                ("2025-06-09/a".to_string(), 1),
                ("2025-06-10/a".to_string(), 2),
            ])
            .unwrap();
        assert_eq!(store.delete_range("", "2025-06-10").unwrap(), 1);
        drop(store);
        let reopened: JsonFileStore<u32> = JsonFileStore::open(dir.path(), "events").unwrap();
        assert_eq!(reopened.scan_prefix("").unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let result: Result<JsonFileStore<u32>> = JsonFileStore::open(dir.path(), "broken");
        assert!(result.is_err());
    }
}
