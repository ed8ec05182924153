//! Attendance resolution.
//!
//! [`SyncOrchestrator`] answers "attendance of person X in month M" from
//! local aggregates where it safely can, and goes upstream only when the
//! temporal policy says local data may be stale. Remote failures degrade
//! to whatever is held locally.

pub mod trace;
pub mod transitions;


use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::ClockSource;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    ActorKind, AggregateKey, Direction, MonthlyAggregate, PersonId, TodayEvent, TodayKey, YearMonth,
};
use crate::policy::{MonthClass, TemporalContext, TemporalPolicy, TimeBand};
use crate::remote::{ApiError, HistoricalMonth, RemoteHistoricalService, RemoteTodayService};
use crate::store::aggregate::covers_any;
use crate::store::{AggregatePair, EphemeralTodayCache, LocalAggregateStore};
use crate::validator::check_pair_sync;

pub use trace::{ErrorReport, SessionReporter, TracingReporter};
pub use transitions::{decide, Action, Facts, Phase};

/// Where the data in an [`AttendanceResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SyncSource {
    LocalCache,
    RemoteHistory,
    RemoteHistoryPlusCache,
    /// Local aggregates completed by a today-service poll.
    LocalCachePlusToday,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AttendanceResult {
    pub entry: Option<MonthlyAggregate>,
    pub exit: Option<MonthlyAggregate>,
    /// False when neither direction holds a recorded day, whether the month
    /// is unknown or known to be empty upstream.
    pub found: bool,
    pub source: SyncSource,
    /// Names the branch taken.
    pub message: String,
}

impl AttendanceResult {
    fn from_pair(pair: AggregatePair, source: SyncSource, message: String) -> Self {
        Self {
            found: pair.has_days(),
            entry: pair.entry,
            exit: pair.exit,
            source,
            message,
        }
    }
}

/// Outcome of a history refetch.
enum Refetch {
    Done { pair: AggregatePair, orphans_merged: usize },
    Unavailable(ApiError),
}

#[derive(Debug, Default)]
struct PollOutcome {
    /// Directions the today service answered for.
    polled: usize,
    /// Days merged into aggregates, from polls or the ephemeral cache.
    merged: usize,
}

pub struct SyncOrchestrator {
    clock: Arc<dyn ClockSource>,
    policy: TemporalPolicy,
    aggregates: Arc<LocalAggregateStore>,
    today: Arc<EphemeralTodayCache>,
    history: Arc<dyn RemoteHistoricalService>,
    today_service: Arc<dyn RemoteTodayService>,
    reporter: Arc<dyn SessionReporter>,
    actor_kind: ActorKind,
    /// Last today-service poll per (person, direction), so an empty answer
    /// still counts for the rate-limit guard.
    poll_ledger: Mutex<HashMap<(PersonId, Direction), NaiveDateTime>>,
}

impl SyncOrchestrator {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        policy: TemporalPolicy,
        aggregates: Arc<LocalAggregateStore>,
        today: Arc<EphemeralTodayCache>,
        history: Arc<dyn RemoteHistoricalService>,
        today_service: Arc<dyn RemoteTodayService>,
    ) -> Self {
        Self {
            clock,
            policy,
            aggregates,
            today,
            history,
            today_service,
            reporter: Arc::new(TracingReporter),
            actor_kind: ActorKind::default(),
            poll_ledger: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_actor_kind(mut self, actor_kind: ActorKind) -> Self {
        self.actor_kind = actor_kind;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SessionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn aggregates(&self) -> &Arc<LocalAggregateStore> {
        &self.aggregates
    }

    pub fn today_cache(&self) -> &Arc<EphemeralTodayCache> {
        &self.today
    }

    fn report(&self, origin: &str, error: &SyncError, context: String) {
        self.reporter
            .report(ErrorReport::new(origin, error, self.clock.now(), context));
    }

    // ========================================================================
    // Resolve
    // ========================================================================

    /// Attendance of `person` in `month`, both directions.
    ///
    /// A month after the current one is a protocol violation: the call
    /// fails without touching the remotes or the stores.
    pub async fn resolve_attendance(
        &self,
        person: &PersonId,
        month: YearMonth,
    ) -> SyncResult<AttendanceResult> {
        let result = self.resolve(person, month).await;
        if let Err(e) = &result {
            self.report("resolve_attendance", e, AggregateKey::pair_prefix(person, month));
        }
        result
    }

    async fn resolve(&self, person: &PersonId, month: YearMonth) -> SyncResult<AttendanceResult> {
        let ctx = self.policy.context(self.clock.now());
        let key = AggregateKey::pair_prefix(person, month);

        let phase = match self.policy.classify_month(month, ctx.now) {
            MonthClass::Future => {
                trace::branch("ABORT", "month is in the future", &key);
                return Err(SyncError::ProtocolViolation {
                    queried: month,
                    current: ctx.month(),
                });
            }
            MonthClass::Past => Phase::PastMonth,
            MonthClass::Current if ctx.is_weekend => Phase::CurrentWeekend,
            MonthClass::Current => match ctx.time_band {
                TimeBand::PreSchool => Phase::CurrentPreSchool,
                TimeBand::Consolidated => Phase::CurrentConsolidated,
                TimeBand::CheckinWindow | TimeBand::FullWindow => Phase::CurrentPolling,
            },
        };

        let pair = self.aggregates.get_pair(person, month)?;
        let facts = self.facts(month, &pair, &ctx);
        let transition = decide(phase, &facts);
        let branch = format!("{}/{}", phase.as_str(), transition.action.as_str());
        trace::branch(&branch, transition.reason, &key);
        let message = format!("{}: {}", branch, transition.reason);

        match transition.action {
            Action::ServeLocal => Ok(AttendanceResult::from_pair(pair, SyncSource::LocalCache, message)),
            Action::RefetchHistory => match self.refetch(person, month, &ctx).await? {
                Refetch::Done { pair, orphans_merged } => {
                    let source = if orphans_merged > 0 {
                        SyncSource::RemoteHistoryPlusCache
                    } else {
                        SyncSource::RemoteHistory
                    };
                    Ok(AttendanceResult::from_pair(pair, source, message))
                }
                Refetch::Unavailable(e) => Ok(self.fall_back(pair, SyncSource::LocalCache, &key, e, message)),
            },
            Action::RepairAndRefetch => {
                let check = check_pair_sync(pair.entry.as_ref(), pair.exit.as_ref(), ctx.now);
                warn!(key = %key, reason = %check.reason, "Local aggregates out of sync, repairing");
                self.aggregates.delete_pair(person, month).await?;
                match self.refetch(person, month, &ctx).await {
                    Ok(Refetch::Done { pair, .. }) => {
                        Ok(AttendanceResult::from_pair(pair, SyncSource::RemoteHistory, message))
                    }
                    Ok(Refetch::Unavailable(source)) | Err(SyncError::Remote(source)) => {
                        Err(SyncError::LocalCorruption { key, source })
                    }
                    Err(e) => Err(e),
                }
            }
            Action::RefetchThenPollToday => match self.refetch(person, month, &ctx).await? {
                Refetch::Done { orphans_merged, .. } => {
                    let outcome = self.poll_today(person, month, &ctx, true).await?;
                    let source = if outcome.polled > 0 || orphans_merged > 0 {
                        SyncSource::RemoteHistoryPlusCache
                    } else {
                        SyncSource::RemoteHistory
                    };
                    let pair = self.aggregates.get_pair(person, month)?;
                    Ok(AttendanceResult::from_pair(pair, source, message))
                }
                Refetch::Unavailable(e) => {
                    // History is down; today is still polled.
                    let outcome = self.poll_today(person, month, &ctx, true).await?;
                    let (pair, source) = if outcome.polled > 0 {
                        (self.aggregates.get_pair(person, month)?, SyncSource::LocalCachePlusToday)
                    } else {
                        (pair, SyncSource::LocalCache)
                    };
                    Ok(self.fall_back(pair, source, &key, e, message))
                }
            },
            Action::PollToday => {
                let outcome = self.poll_today(person, month, &ctx, false).await?;
                if outcome.polled == 0 && outcome.merged == 0 {
                    return Ok(AttendanceResult::from_pair(pair, SyncSource::LocalCache, message));
                }
                let source = if outcome.polled > 0 {
                    SyncSource::LocalCachePlusToday
                } else {
                    SyncSource::LocalCache
                };
                let pair = self.aggregates.get_pair(person, month)?;
                Ok(AttendanceResult::from_pair(pair, source, message))
            }
        }
    }

    fn facts(&self, month: YearMonth, pair: &AggregatePair, ctx: &TemporalContext) -> Facts {
        let now = ctx.now;
        let newest = pair.newest_refresh();
        let coverage_days = self.policy.coverage_days(now, month);
        Facts {
            aggregate_present: !pair.is_absent(),
            in_sync: check_pair_sync(pair.entry.as_ref(), pair.exit.as_ref(), now).in_sync,
            polled_in_current_band: newest
                .map(|last| self.policy.already_polled_in_current_band(last, now))
                .unwrap_or(false),
            refresh_age: pair
                .oldest_refresh()
                .map(|last| self.policy.compare_refresh_month(last, month)),
            coverage: coverage_days.is_empty()
                || pair
                    .entry
                    .as_ref()
                    .map(|entry| covers_any(entry, &coverage_days))
                    .unwrap_or(false),
            weekend_carryover_complete: newest
                .map(|last| self.policy.weekend_carryover_complete(last, now))
                .unwrap_or(false),
        }
    }

    fn fall_back(
        &self,
        pair: AggregatePair,
        source: SyncSource,
        key: &str,
        error: ApiError,
        message: String,
    ) -> AttendanceResult {
        warn!(key = %key, error = %error, local = !pair.is_absent(), "History unavailable, serving local data");
        AttendanceResult::from_pair(pair, source, format!("{} (remote unavailable: {})", message, error))
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Replace both directions from history, then fold back same-day events
    /// the replacement would otherwise lose.
    async fn refetch(
        &self,
        person: &PersonId,
        month: YearMonth,
        ctx: &TemporalContext,
    ) -> SyncResult<Refetch> {
        let fetched = match self.history.fetch_month(person, self.actor_kind, month).await {
            Ok(fetched) => fetched,
            Err(ApiError::NotFound(_)) => None,
            Err(e) if e.is_unavailable() => return Ok(Refetch::Unavailable(e)),
            Err(e) => return Err(e.into()),
        };

        let HistoricalMonth {
            entries,
            exits,
            refreshed_at,
        } = match fetched {
            Some(fetched) => fetched,
            None => {
                info!(person = %person, month = %month, "No history upstream, recording month as empty");
                HistoricalMonth::default()
            }
        };
        debug!(
            person = %person,
            month = %month,
            entries = entries.len(),
            exits = exits.len(),
            upstream_refreshed_at = ?refreshed_at,
            "Fetched monthly history"
        );

        // Read once the fetch has returned.
        let today = ctx.now.date();
        let orphans = if month.contains(today) {
            self.today.events_for_person(person, today)?
        } else {
            Vec::new()
        };
        let pair = self.aggregates.replace_all(person, month, entries, exits).await?;
        let orphans_merged = self.reconcile_orphans(orphans, month).await?;
        let pair = if orphans_merged > 0 {
            self.aggregates.get_pair(person, month)?
        } else {
            pair
        };
        Ok(Refetch::Done { pair, orphans_merged })
    }

    /// Merge each orphan whose day the refreshed aggregate lacks, and evict
    /// every orphan from the ephemeral cache. Returns how many were merged.
    async fn reconcile_orphans(&self, orphans: Vec<TodayEvent>, month: YearMonth) -> SyncResult<usize> {
        let mut merged = 0;
        for event in orphans {
            if !month.contains(event.key.day) {
                continue;
            }
            let key = AggregateKey::new(event.key.person.clone(), event.key.direction, month);
            let day = event.day_of_month();
            let known = self
                .aggregates
                .get(&key)?
                .map(|aggregate| aggregate.has_day(day))
                .unwrap_or(false);
            if !known {
                self.aggregates.upsert_day(&key, day, event.to_day_record()).await?;
                merged += 1;
                debug!(key = %key, day, "Merged orphan same-day event");
            }
            self.today.evict(&event.key)?;
        }
        Ok(merged)
    }

    // ========================================================================
    // Today
    // ========================================================================

    /// Bring today's slot of each direction the band requires up to date.
    /// With `force`, every required direction is polled; otherwise days
    /// already held locally and directions inside the cooldown are skipped.
    async fn poll_today(
        &self,
        person: &PersonId,
        month: YearMonth,
        ctx: &TemporalContext,
        force: bool,
    ) -> SyncResult<PollOutcome> {
        let today = ctx.now.date();
        let mut outcome = PollOutcome::default();
        let mut due = Vec::new();

        for &direction in ctx.time_band.required_directions() {
            let key = AggregateKey::new(person.clone(), direction, month);
            if force {
                due.push(direction);
                continue;
            }

            let aggregate = self.aggregates.get(&key)?;
            if aggregate.as_ref().map(|a| a.has_date(today)).unwrap_or(false) {
                trace::branch("SKIP_POLL", "today already recorded", &key.storage_key());
                continue;
            }
            if let Some(event) = self.cached_today(person, direction, today)? {
                self.aggregates
                    .upsert_day(&key, event.day_of_month(), event.to_day_record())
                    .await?;
                outcome.merged += 1;
                trace::branch("SKIP_POLL", "completed from same-day cache", &key.storage_key());
                continue;
            }
            let last = self.last_poll(person, direction, aggregate.as_ref());
            if last
                .map(|last| self.policy.already_polled_in_current_band(last, ctx.now))
                .unwrap_or(false)
            {
                trace::branch("SKIP_POLL", "polled in the current band", &key.storage_key());
                continue;
            }
            due.push(direction);
        }

        if due.is_empty() {
            return Ok(outcome);
        }

        let polls = due
            .iter()
            .map(|&direction| self.today_service.query_today(self.actor_kind, direction));
        let results = join_all(polls).await;

        // Each direction lands on its own; one failing poll doesn't undo the other.
        for (direction, result) in due.into_iter().zip(results) {
            match result {
                Ok(events) => {
                    self.note_poll(person, direction, ctx.now);
                    outcome.polled += 1;
                    outcome.merged += self.absorb(person, month, direction, events, today).await?;
                }
                Err(e) => {
                    warn!(person = %person, direction = %direction, error = %e, "Today poll failed");
                    if !e.is_unavailable() {
                        let context = format!("{}/{}", person, direction.as_str());
                        self.report("poll_today", &SyncError::Remote(e), context);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Cache every event of today from a poll; merge the ones belonging to
    /// `person` into the aggregate. Returns how many were merged.
    async fn absorb(
        &self,
        person: &PersonId,
        month: YearMonth,
        direction: Direction,
        events: Vec<TodayEvent>,
        today: NaiveDate,
    ) -> SyncResult<usize> {
        let key = AggregateKey::new(person.clone(), direction, month);
        let mut merged = 0;
        for event in events {
            if event.key.day != today || event.key.direction != direction {
                continue;
            }
            let event = self.today.store(event)?;
            if event.key.person == *person && month.contains(event.key.day) {
                self.aggregates
                    .upsert_day(&key, event.day_of_month(), event.to_day_record())
                    .await?;
                merged += 1;
            }
        }
        Ok(merged)
    }

    fn cached_today(
        &self,
        person: &PersonId,
        direction: Direction,
        today: NaiveDate,
    ) -> SyncResult<Option<TodayEvent>> {
        Ok(self
            .today
            .events_for_person(person, today)?
            .into_iter()
            .find(|event| event.key.direction == direction))
    }

    fn last_poll(
        &self,
        person: &PersonId,
        direction: Direction,
        aggregate: Option<&MonthlyAggregate>,
    ) -> Option<NaiveDateTime> {
        let polled = self
            .poll_ledger
            .lock()
            .get(&(person.clone(), direction))
            .copied();
        let refreshed = aggregate.map(|a| a.last_refreshed_at);
        polled.max(refreshed)
    }

    fn note_poll(&self, person: &PersonId, direction: Direction, now: NaiveDateTime) {
        let mut ledger = self.poll_ledger.lock();
        ledger.retain(|_, at| at.date() == now.date());
        ledger.insert((person.clone(), direction), now);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Register an event upstream and apply the echo locally.
    pub async fn record_event(
        &self,
        person: &PersonId,
        direction: Direction,
        expected_time: NaiveDateTime,
    ) -> SyncResult<TodayEvent> {
        let result = self.record(person, direction, expected_time).await;
        if let Err(e) = &result {
            self.report("record_event", e, format!("{}/{}", person, direction.as_str()));
        }
        result
    }

    async fn record(
        &self,
        person: &PersonId,
        direction: Direction,
        expected_time: NaiveDateTime,
    ) -> SyncResult<TodayEvent> {
        let now = self.clock.now();
        let echo = self.today_service.register(direction, person, expected_time).await?;
        if echo.key.person != *person || echo.key.direction != direction {
            return Err(SyncError::InvalidRequest(format!(
                "register echo for {}/{} does not match {}/{}",
                echo.key.person,
                echo.key.direction.as_str(),
                person,
                direction.as_str()
            )));
        }

        let event = if echo.key.day == now.date() {
            self.today.store(echo)?
        } else {
            echo
        };

        let month = YearMonth::of_date(event.key.day);
        if self.policy.classify_month(month, now) != MonthClass::Future {
            let key = AggregateKey::new(person.clone(), direction, month);
            self.aggregates
                .upsert_day(&key, event.day_of_month(), event.to_day_record())
                .await?;
        }
        info!(
            person = %person,
            direction = %direction,
            status = %event.status,
            deviation_seconds = event.deviation_seconds,
            "Recorded event"
        );
        Ok(event)
    }

    /// Ask upstream to retract today's event; mirror a confirmed removal.
    /// Returns whether upstream removed anything.
    pub async fn retract_event(
        &self,
        person: &PersonId,
        direction: Direction,
        sub_key: Option<&str>,
    ) -> SyncResult<bool> {
        let result = self.retract(person, direction, sub_key).await;
        if let Err(e) = &result {
            self.report("retract_event", e, format!("{}/{}", person, direction.as_str()));
        }
        result
    }

    async fn retract(&self, person: &PersonId, direction: Direction, sub_key: Option<&str>) -> SyncResult<bool> {
        let removed = self.today_service.retract(person, direction, sub_key).await?;
        if !removed {
            debug!(person = %person, direction = %direction, "Nothing to retract upstream");
            return Ok(false);
        }
        let today = self.clock.now().date();
        self.mirror_deletion(person, direction, today, sub_key).await?;
        Ok(true)
    }

    /// Apply a confirmed upstream deletion: drop the day from the aggregate
    /// (deleting the aggregate if it was the last day) and evict matching
    /// same-day events.
    pub async fn mirror_deletion(
        &self,
        person: &PersonId,
        direction: Direction,
        day: NaiveDate,
        sub_key: Option<&str>,
    ) -> SyncResult<()> {
        let key = AggregateKey::new(person.clone(), direction, YearMonth::of_date(day));
        let removed_day = self.aggregates.delete_day(&key, day.day()).await?;
        let evicted = match sub_key {
            Some(sub) => {
                let today_key = TodayKey::new(person.clone(), direction, day).with_sub_key(sub);
                usize::from(self.today.evict(&today_key)?)
            }
            None => self.today.evict_matching(person, direction, day)?,
        };
        info!(key = %key, day = %day, removed_day, evicted, "Mirrored remote deletion");
        Ok(())
    }
}
