use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::KeyedStore;
use crate::clock::ClockSource;
use crate::models::{AggregateKey, DayRecord, Direction, MonthlyAggregate, PersonId, YearMonth};

/// Once the lock table grows past this, idle entries are pruned.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 256;

/// Both directions of one (person, month).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatePair {
    pub entry: Option<MonthlyAggregate>,
    pub exit: Option<MonthlyAggregate>,
}

impl AggregatePair {
    pub fn get(&self, direction: Direction) -> Option<&MonthlyAggregate> {
        match direction {
            Direction::CheckIn => self.entry.as_ref(),
            Direction::CheckOut => self.exit.as_ref(),
        }
    }

    /// Neither direction is known locally.
    pub fn is_absent(&self) -> bool {
        self.entry.is_none() && self.exit.is_none()
    }

    /// At least one direction holds a recorded day.
    pub fn has_days(&self) -> bool {
        [self.entry.as_ref(), self.exit.as_ref()]
            .into_iter()
            .flatten()
            .any(|a| !a.is_empty())
    }

    /// Refresh time of the staler of the present aggregates.
    pub fn oldest_refresh(&self) -> Option<NaiveDateTime> {
        [self.entry.as_ref(), self.exit.as_ref()]
            .into_iter()
            .flatten()
            .map(|a| a.last_refreshed_at)
            .min()
    }

    pub fn newest_refresh(&self) -> Option<NaiveDateTime> {
        [self.entry.as_ref(), self.exit.as_ref()]
            .into_iter()
            .flatten()
            .map(|a| a.last_refreshed_at)
            .max()
    }
}

/// Durable store of monthly aggregates keyed by (person, direction, month).
///
/// Reads go straight to the backing store. Every read-modify-write holds a
/// per-key async lock, so overlapping resolves for the same aggregate can't
/// lose each other's days. No operation holds two keys' locks at once.
pub struct LocalAggregateStore {
    store: Arc<dyn KeyedStore<MonthlyAggregate>>,
    clock: Arc<dyn ClockSource>,
    locks: Mutex<HashMap<AggregateKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalAggregateStore {
    pub fn new(store: Arc<dyn KeyedStore<MonthlyAggregate>>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            store,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &AggregateKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > LOCK_TABLE_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    pub fn get(&self, key: &AggregateKey) -> Result<Option<MonthlyAggregate>> {
        self.store.get(&key.storage_key())
    }

    /// Both directions for (person, month) with one index scan.
    pub fn get_pair(&self, person: &PersonId, month: YearMonth) -> Result<AggregatePair> {
        let prefix = format!("{}/", AggregateKey::pair_prefix(person, month));
        let mut pair = AggregatePair::default();
        for (_, aggregate) in self.store.scan_prefix(&prefix)? {
            match aggregate.direction {
                Direction::CheckIn => pair.entry = Some(aggregate),
                Direction::CheckOut => pair.exit = Some(aggregate),
            }
        }
        Ok(pair)
    }

    /// Merge one day, creating the aggregate when absent.
    pub async fn upsert_day(
        &self,
        key: &AggregateKey,
        day: u32,
        record: DayRecord,
    ) -> Result<MonthlyAggregate> {
        if !key.month.is_valid_day(day) {
            anyhow::bail!("day {} is not a valid day of {}", day, key.month);
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let storage_key = key.storage_key();
        let now = self.clock.now();
        let mut aggregate = self
            .store
            .get(&storage_key)?
            .unwrap_or_else(|| MonthlyAggregate::empty(key, now));
        aggregate.days.insert(day, record.normalized(key.direction));
        aggregate.touch(now);
        self.store.put(&storage_key, aggregate.clone())?;

        debug!(key = %key, day, "Merged day into aggregate");
        Ok(aggregate)
    }

    /// Remove one day; removing the last day deletes the aggregate.
    /// Returns whether a day was removed.
    pub async fn delete_day(&self, key: &AggregateKey, day: u32) -> Result<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let storage_key = key.storage_key();
        let Some(mut aggregate) = self.store.get(&storage_key)? else {
            return Ok(false);
        };
        if aggregate.days.remove(&day).is_none() {
            return Ok(false);
        }

        if aggregate.is_empty() {
            self.store.remove(&storage_key)?;
            debug!(key = %key, day, "Removed last day, aggregate deleted");
        } else {
            aggregate.touch(self.clock.now());
            self.store.put(&storage_key, aggregate)?;
            debug!(key = %key, day, "Removed day from aggregate");
        }
        Ok(true)
    }

    /// Replace both directions after a full remote refresh. Empty maps are
    /// stored as empty aggregates, marking the month as known-empty.
    pub async fn replace_all(
        &self,
        person: &PersonId,
        month: YearMonth,
        entry_days: BTreeMap<u32, DayRecord>,
        exit_days: BTreeMap<u32, DayRecord>,
    ) -> Result<AggregatePair> {
        let mut pair = AggregatePair::default();
        for (direction, days) in [(Direction::CheckIn, entry_days), (Direction::CheckOut, exit_days)] {
            let key = AggregateKey::new(person.clone(), direction, month);
            let aggregate = self.replace_one(&key, days).await?;
            match direction {
                Direction::CheckIn => pair.entry = Some(aggregate),
                Direction::CheckOut => pair.exit = Some(aggregate),
            }
        }
        Ok(pair)
    }

    async fn replace_one(
        &self,
        key: &AggregateKey,
        days: BTreeMap<u32, DayRecord>,
    ) -> Result<MonthlyAggregate> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let storage_key = key.storage_key();
        let now = self.clock.now();
        let previous = self.store.get(&storage_key)?;

        let mut aggregate = MonthlyAggregate::empty(key, now);
        aggregate.days = days
            .into_iter()
            .map(|(day, record)| (day, record.normalized(key.direction)))
            .collect();
        let dropped = aggregate.retain_valid_days();
        if dropped > 0 {
            warn!(key = %key, dropped, "Discarded days outside the month from remote data");
        }
        if let Some(prev) = previous {
            aggregate.touch(prev.last_refreshed_at);
        }
        self.store.put(&storage_key, aggregate.clone())?;
        debug!(key = %key, days = aggregate.days.len(), "Replaced aggregate");
        Ok(aggregate)
    }

    /// Wipe both directions of (person, month). Returns how many existed.
    pub async fn delete_pair(&self, person: &PersonId, month: YearMonth) -> Result<usize> {
        let mut removed = 0;
        for direction in Direction::ALL {
            let key = AggregateKey::new(person.clone(), direction, month);
            let lock = self.lock_for(&key);
            let _guard = lock.lock().await;
            if self.store.remove(&key.storage_key())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// True iff at least one of `days` is present in the aggregate. An
    /// empty `days` list has nothing to cover and counts as covered.
    pub fn has_coverage_in_last_n_school_days(&self, key: &AggregateKey, days: &[u32]) -> Result<bool> {
        if days.is_empty() {
            return Ok(true);
        }
        Ok(self
            .get(key)?
            .map(|aggregate| covers_any(&aggregate, days))
            .unwrap_or(false))
    }
}

pub(crate) fn covers_any(aggregate: &MonthlyAggregate, days: &[u32]) -> bool {
    days.is_empty() || days.iter().any(|d| aggregate.has_day(*d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, NaiveDate};

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn june() -> YearMonth {
        YearMonth::new(2025, 6).unwrap()
    }

    fn setup() -> (LocalAggregateStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(at(10, 9, 0)));
        let store = LocalAggregateStore::new(Arc::new(MemoryStore::<MonthlyAggregate>::new()), clock.clone());
        (store, clock)
    }

    fn key(direction: Direction) -> AggregateKey {
        AggregateKey::new(PersonId::new("p-1"), direction, june())
    }

    fn record(day: u32) -> DayRecord {
        DayRecord::new(Direction::CheckIn, at(day, 8, 0), 0)
    }

    #[tokio::test]
    async fn test_upsert_creates_and_bumps() {
        let (store, clock) = setup();
        let k = key(Direction::CheckIn);
        assert!(store.get(&k).unwrap().is_none());

        store.upsert_day(&k, 9, record(9)).await.unwrap();
        clock.advance(Duration::minutes(5));
        let agg = store.upsert_day(&k, 10, record(10)).await.unwrap();

        assert_eq!(agg.days.len(), 2);
        assert_eq!(agg.last_refreshed_at, at(10, 9, 5));
        assert_eq!(store.get(&k).unwrap().unwrap(), agg);
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_day() {
        let (store, _) = setup();
        assert!(store.upsert_day(&key(Direction::CheckIn), 31, record(1)).await.is_err());
        assert!(store.upsert_day(&key(Direction::CheckIn), 0, record(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_last_day_removes_aggregate() {
        let (store, _) = setup();
        let k = key(Direction::CheckIn);
        store.upsert_day(&k, 9, record(9)).await.unwrap();
        assert!(store.delete_day(&k, 9).await.unwrap());
        assert!(store.get(&k).unwrap().is_none());
        assert!(!store.delete_day(&k, 9).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_non_last_day_keeps_others() {
        let (store, _) = setup();
        let k = key(Direction::CheckIn);
        for day in [5, 6, 9] {
            store.upsert_day(&k, day, record(day)).await.unwrap();
        }
        assert!(store.delete_day(&k, 6).await.unwrap());
        let days: Vec<u32> = store.get(&k).unwrap().unwrap().days.keys().copied().collect();
        assert_eq!(days, vec![5, 9]);
    }

    #[tokio::test]
    async fn test_replace_all_and_pair_lookup() {
        let (store, _) = setup();
        let person = PersonId::new("p-1");
        let mut entries = BTreeMap::new();
        entries.insert(2, record(2));
        entries.insert(31, record(3)); // not a June day
        let pair = store
            .replace_all(&person, june(), entries, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(pair.entry.as_ref().unwrap().days.len(), 1);
        assert!(pair.exit.as_ref().unwrap().is_empty());

        let loaded = store.get_pair(&person, june()).unwrap();
        assert_eq!(loaded, pair);
        // Another person's data does not leak into the scan
        assert!(store.get_pair(&PersonId::new("p-10"), june()).unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_replace_all_never_moves_refresh_backwards() {
        let (store, clock) = setup();
        let person = PersonId::new("p-1");
        store.upsert_day(&key(Direction::CheckIn), 2, record(2)).await.unwrap();
        clock.set(at(10, 8, 0));
        let pair = store
            .replace_all(&person, june(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(pair.entry.unwrap().last_refreshed_at, at(10, 9, 0));
        assert_eq!(pair.exit.unwrap().last_refreshed_at, at(10, 8, 0));
    }

    #[tokio::test]
    async fn test_delete_pair() {
        let (store, _) = setup();
        let person = PersonId::new("p-1");
        store.upsert_day(&key(Direction::CheckIn), 2, record(2)).await.unwrap();
        store.upsert_day(&key(Direction::CheckOut), 2, record(2)).await.unwrap();
        assert_eq!(store.delete_pair(&person, june()).await.unwrap(), 2);
        assert!(store.get_pair(&person, june()).unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_coverage() {
        let (store, _) = setup();
        let k = key(Direction::CheckIn);
        assert!(!store.has_coverage_in_last_n_school_days(&k, &[9, 6, 5]).unwrap());
        store.upsert_day(&k, 6, record(6)).await.unwrap();
        // Day 9 missing (an absence) but 6 is there: good enough
        assert!(store.has_coverage_in_last_n_school_days(&k, &[9, 6, 5]).unwrap());
        assert!(!store.has_coverage_in_last_n_school_days(&k, &[9]).unwrap());
        assert!(store.has_coverage_in_last_n_school_days(&k, &[]).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_same_key_lose_nothing() {
        let (store, _) = setup();
        let store = Arc::new(store);
        let k = key(Direction::CheckIn);
        let tasks: Vec<_> = (1..=20u32)
            .map(|day| {
                let store = Arc::clone(&store);
                let k = k.clone();
                tokio::spawn(async move { store.upsert_day(&k, day, record(day)).await })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }
        assert_eq!(store.get(&k).unwrap().unwrap().days.len(), 20);
    }
}
