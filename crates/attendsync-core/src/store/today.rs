use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::KeyedStore;
use crate::clock::ClockSource;
use crate::config::TodayCacheConfig;
use crate::models::{Direction, PersonId, TodayEvent, TodayKey};

/// Same-day events with a per-kind lifetime.
///
/// Every operation first drops all records dated before today, at most
/// once per calendar day per cache handle. Expired records are discarded
/// lazily on read and in bulk by [`EphemeralTodayCache::purge_expired`].
pub struct EphemeralTodayCache {
    store: Arc<dyn KeyedStore<TodayEvent>>,
    clock: Arc<dyn ClockSource>,
    config: TodayCacheConfig,
    last_purge_day: Mutex<Option<NaiveDate>>,
}

impl EphemeralTodayCache {
    pub fn new(
        store: Arc<dyn KeyedStore<TodayEvent>>,
        clock: Arc<dyn ClockSource>,
        config: TodayCacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            last_purge_day: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TodayCacheConfig {
        &self.config
    }

    fn is_expired(&self, event: &TodayEvent, now: NaiveDateTime) -> bool {
        event.key.day < now.date() || now - event.fetched_at > self.config.max_age(event.key.direction)
    }

    fn purge_stale_days(&self) -> Result<()> {
        let today = self.clock.now().date();
        self.purge_before(today)?;
        Ok(())
    }

    /// Delete everything dated before `date_exclusive`. Repeat calls for the
    /// same (or an earlier) date are no-ops.
    pub fn purge_before(&self, date_exclusive: NaiveDate) -> Result<usize> {
        let mut last = self.last_purge_day.lock();
        if matches!(*last, Some(done) if done >= date_exclusive) {
            return Ok(0);
        }
        let removed = self
            .store
            .delete_range("", &TodayKey::day_prefix(date_exclusive))?;
        *last = Some(date_exclusive);
        if removed > 0 {
            info!(removed, before = %date_exclusive, "Purged same-day events from previous days");
        }
        Ok(removed)
    }

    /// The event for `key`, unless it is older than its kind's max age.
    /// Expired records are deleted on the way out.
    pub fn lookup(&self, key: &TodayKey) -> Result<Option<TodayEvent>> {
        self.purge_stale_days()?;
        let storage_key = key.storage_key();
        let Some(event) = self.store.get(&storage_key)? else {
            return Ok(None);
        };
        if self.is_expired(&event, self.clock.now()) {
            self.store.remove(&storage_key)?;
            debug!(key = %storage_key, "Discarded expired same-day event");
            return Ok(None);
        }
        Ok(Some(event))
    }

    /// Upsert, stamping `fetched_at` with the current time.
    pub fn store(&self, mut event: TodayEvent) -> Result<TodayEvent> {
        self.purge_stale_days()?;
        event.fetched_at = self.clock.now();
        self.store.put(&event.key.storage_key(), event.clone())?;
        debug!(key = %event.key.storage_key(), "Stored same-day event");
        Ok(event)
    }

    /// Live events of `person` on `day`.
    pub fn events_for_person(&self, person: &PersonId, day: NaiveDate) -> Result<Vec<TodayEvent>> {
        self.purge_stale_days()?;
        let now = self.clock.now();
        let prefix = format!("{}/", TodayKey::person_day_prefix(person, day));
        Ok(self
            .store
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(_, event)| event)
            .filter(|event| !self.is_expired(event, now))
            .collect())
    }

    pub fn evict(&self, key: &TodayKey) -> Result<bool> {
        self.purge_stale_days()?;
        self.store.remove(&key.storage_key())
    }

    /// Evict every event of (person, direction, day), whatever its sub-key.
    pub fn evict_matching(&self, person: &PersonId, direction: Direction, day: NaiveDate) -> Result<usize> {
        self.purge_stale_days()?;
        let base = TodayKey::new(person.clone(), direction, day).storage_key();
        let mut keys: Vec<String> = self
            .store
            .scan_prefix(&format!("{}/", base))?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.push(base);
        self.store.remove_many(&keys)
    }

    /// Sweep every expired record. Independent of day boundaries.
    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_stale_days()?;
        let now = self.clock.now();
        let expired: Vec<String> = self
            .store
            .scan_prefix("")?
            .into_iter()
            .filter(|(_, event)| self.is_expired(event, now))
            .map(|(k, _)| k)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let removed = self.store.remove_many(&expired)?;
        debug!(removed, "Swept expired same-day events");
        Ok(removed)
    }
}

/// Run [`EphemeralTodayCache::purge_expired`] every `interval` until the
/// returned handle is aborted.
pub fn spawn_expiry_sweeper(cache: Arc<EphemeralTodayCache>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = cache.purge_expired() {
                warn!(error = %e, "Expiry sweep failed");
            }
        }
    })
}
