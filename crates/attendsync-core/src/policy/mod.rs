//! Temporal refresh policy.
//!
//! Pure functions of (now, last refresh, queried month) deciding which
//! remote tier may be consulted. Nothing here performs I/O or keeps state;
//! a fresh [`TemporalContext`] is built for every resolve.

pub mod schedule;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::models::{is_school_day, Direction, YearMonth};

pub use schedule::recent_school_days;

/// Clock-hour range governing which remote tier may be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeBand {
    /// Nothing new can exist upstream yet.
    PreSchool,
    /// Only check-ins are being produced.
    CheckinWindow,
    /// Both directions are being produced.
    FullWindow,
    /// The day has been folded into the historical service.
    Consolidated,
}

impl TimeBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBand::PreSchool => "PRE_SCHOOL",
            TimeBand::CheckinWindow => "CHECKIN_WINDOW",
            TimeBand::FullWindow => "FULL_WINDOW",
            TimeBand::Consolidated => "CONSOLIDATED",
        }
    }

    /// Directions the today service can have new events for in this band.
    pub fn required_directions(&self) -> &'static [Direction] {
        match self {
            TimeBand::CheckinWindow => &[Direction::CheckIn],
            TimeBand::FullWindow => &[Direction::CheckIn, Direction::CheckOut],
            TimeBand::PreSchool | TimeBand::Consolidated => &[],
        }
    }
}

impl std::fmt::Display for TimeBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthClass {
    Current,
    Past,
    /// Only reachable through clock skew or a bad caller.
    Future,
}

/// Where the month of the last refresh falls relative to the queried month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAge {
    /// Refreshed after the month ended; the data is final.
    Later,
    /// Refreshed during the month; it may still have changed.
    Same,
    /// Refreshed before the month started; the data is incomplete.
    Earlier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalContext {
    pub now: NaiveDateTime,
    pub is_weekend: bool,
    pub time_band: TimeBand,
}

impl TemporalContext {
    pub fn month(&self) -> YearMonth {
        YearMonth::of(self.now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemporalPolicy {
    config: PolicyConfig,
}

impl TemporalPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn context(&self, now: NaiveDateTime) -> TemporalContext {
        TemporalContext {
            now,
            is_weekend: !is_school_day(now.date()),
            time_band: self.time_band(now),
        }
    }

    pub fn classify_month(&self, queried: YearMonth, now: NaiveDateTime) -> MonthClass {
        let current = YearMonth::of(now);
        match queried.cmp(&current) {
            std::cmp::Ordering::Equal => MonthClass::Current,
            std::cmp::Ordering::Less => MonthClass::Past,
            std::cmp::Ordering::Greater => MonthClass::Future,
        }
    }

    pub fn time_band(&self, now: NaiveDateTime) -> TimeBand {
        let hour = now.hour();
        if hour < self.config.checkin_window_start_hour {
            TimeBand::PreSchool
        } else if hour >= self.config.consolidated_start_hour {
            TimeBand::Consolidated
        } else if hour < self.config.full_window_start_hour {
            TimeBand::CheckinWindow
        } else {
            TimeBand::FullWindow
        }
    }

    /// True when `last` is on the same day and in the same band as `now`
    /// and the cooldown has not elapsed yet.
    pub fn already_polled_in_current_band(&self, last: NaiveDateTime, now: NaiveDateTime) -> bool {
        let elapsed = now - last;
        if elapsed < chrono::Duration::zero() {
            return false;
        }
        last.date() == now.date()
            && self.time_band(last) == self.time_band(now)
            && elapsed < self.config.poll_cooldown()
    }

    pub fn compare_refresh_month(&self, last: NaiveDateTime, queried: YearMonth) -> RefreshAge {
        let refreshed = YearMonth::of(last);
        match refreshed.cmp(&queried) {
            std::cmp::Ordering::Greater => RefreshAge::Later,
            std::cmp::Ordering::Equal => RefreshAge::Same,
            std::cmp::Ordering::Less => RefreshAge::Earlier,
        }
    }

    pub fn is_finalized_past_month(&self, last: NaiveDateTime, queried: YearMonth) -> bool {
        self.compare_refresh_month(last, queried) == RefreshAge::Later
    }

    /// True when `last` is the Friday just before `now` at or after the
    /// end-of-day hour, i.e. local data already holds the final week state.
    pub fn weekend_carryover_complete(&self, last: NaiveDateTime, now: NaiveDateTime) -> bool {
        if last.weekday() != Weekday::Fri || last.hour() < self.config.friday_end_of_day_hour {
            return false;
        }
        let days_since_friday = (now.weekday().num_days_from_monday() + 7
            - Weekday::Fri.num_days_from_monday())
            % 7;
        let friday = now.date() - chrono::Duration::days(days_since_friday as i64);
        last.date() == friday
    }

    /// School days of `month` that the coverage check should look at.
    pub fn coverage_days(&self, now: NaiveDateTime, month: YearMonth) -> Vec<u32> {
        recent_school_days(now.date(), month, self.config.coverage_school_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn policy() -> TemporalPolicy {
        TemporalPolicy::default()
    }

    #[test]
    fn test_classify_month() {
        let now = at(2025, 6, 10, 9, 0, 0);
        let p = policy();
        assert_eq!(p.classify_month(YearMonth::new(2025, 6).unwrap(), now), MonthClass::Current);
        assert_eq!(p.classify_month(YearMonth::new(2025, 5).unwrap(), now), MonthClass::Past);
        assert_eq!(p.classify_month(YearMonth::new(2024, 12).unwrap(), now), MonthClass::Past);
        assert_eq!(p.classify_month(YearMonth::new(2025, 7).unwrap(), now), MonthClass::Future);
    }

    #[test]
    fn test_time_band_boundaries() {
        let p = policy();
        assert_eq!(p.time_band(at(2025, 6, 10, 6, 59, 59)), TimeBand::PreSchool);
        assert_eq!(p.time_band(at(2025, 6, 10, 7, 0, 0)), TimeBand::CheckinWindow);
        assert_eq!(p.time_band(at(2025, 6, 10, 9, 0, 0)), TimeBand::CheckinWindow);
        assert_eq!(p.time_band(at(2025, 6, 10, 12, 0, 0)), TimeBand::FullWindow);
        assert_eq!(p.time_band(at(2025, 6, 10, 18, 59, 0)), TimeBand::FullWindow);
        assert_eq!(p.time_band(at(2025, 6, 10, 19, 0, 0)), TimeBand::Consolidated);
        assert_eq!(p.time_band(at(2025, 6, 10, 23, 59, 0)), TimeBand::Consolidated);
    }

    #[test]
    fn test_required_directions() {
        assert_eq!(TimeBand::CheckinWindow.required_directions(), &[Direction::CheckIn]);
        assert_eq!(TimeBand::FullWindow.required_directions().len(), 2);
        assert!(TimeBand::PreSchool.required_directions().is_empty());
        assert!(TimeBand::Consolidated.required_directions().is_empty());
    }

    #[test]
    fn test_already_polled_cooldown_edges() {
        let p = policy();
        let last = at(2025, 6, 10, 7, 10, 0);
        assert!(p.already_polled_in_current_band(last, last + Duration::minutes(44)));
        assert!(!p.already_polled_in_current_band(
            last,
            last + Duration::minutes(45) + Duration::seconds(1)
        ));
    }

    #[test]
    fn test_already_polled_band_change() {
        let p = policy();
        // 11:50 -> 12:05 crosses from CHECKIN_WINDOW to FULL_WINDOW
        assert!(!p.already_polled_in_current_band(at(2025, 6, 10, 11, 50, 0), at(2025, 6, 10, 12, 5, 0)));
    }

    #[test]
    fn test_already_polled_other_day_or_skew() {
        let p = policy();
        assert!(!p.already_polled_in_current_band(at(2025, 6, 9, 23, 50, 0), at(2025, 6, 10, 0, 10, 0)));
        // Last refresh in the future (clock skew)
        assert!(!p.already_polled_in_current_band(at(2025, 6, 10, 9, 30, 0), at(2025, 6, 10, 9, 0, 0)));
    }

    #[test]
    fn test_finalized_past_month() {
        let p = policy();
        let may = YearMonth::new(2025, 5).unwrap();
        assert!(p.is_finalized_past_month(at(2025, 6, 1, 0, 5, 0), may));
        assert!(!p.is_finalized_past_month(at(2025, 5, 31, 23, 0, 0), may));
        assert_eq!(p.compare_refresh_month(at(2025, 4, 30, 12, 0, 0), may), RefreshAge::Earlier);
        assert_eq!(p.compare_refresh_month(at(2025, 5, 12, 12, 0, 0), may), RefreshAge::Same);
    }

    #[test]
    fn test_weekend_carryover() {
        let p = policy();
        // 2025-06-13 is a Friday, 14 Saturday, 15 Sunday
        let friday_late = at(2025, 6, 13, 21, 0, 0);
        assert!(p.weekend_carryover_complete(friday_late, at(2025, 6, 14, 10, 0, 0)));
        assert!(p.weekend_carryover_complete(friday_late, at(2025, 6, 15, 10, 0, 0)));
        // Friday afternoon is not end of day
        assert!(!p.weekend_carryover_complete(at(2025, 6, 13, 15, 0, 0), at(2025, 6, 14, 10, 0, 0)));
        // A Friday from the week before doesn't count
        assert!(!p.weekend_carryover_complete(at(2025, 6, 6, 21, 0, 0), at(2025, 6, 14, 10, 0, 0)));
        // Thursday night
        assert!(!p.weekend_carryover_complete(at(2025, 6, 12, 22, 0, 0), at(2025, 6, 14, 10, 0, 0)));
    }

    #[test]
    fn test_context_is_fresh() {
        let p = policy();
        let ctx = p.context(at(2025, 6, 14, 9, 0, 0));
        assert!(ctx.is_weekend);
        assert_eq!(ctx.time_band, TimeBand::CheckinWindow);
        assert_eq!(ctx.month(), YearMonth::new(2025, 6).unwrap());
    }

    #[test]
    fn test_custom_boundaries() {
        let p = TemporalPolicy::new(PolicyConfig {
            checkin_window_start_hour: 6,
            full_window_start_hour: 11,
            consolidated_start_hour: 18,
            ..PolicyConfig::default()
        });
        assert_eq!(p.time_band(at(2025, 6, 10, 6, 30, 0)), TimeBand::CheckinWindow);
        assert_eq!(p.time_band(at(2025, 6, 10, 18, 0, 0)), TimeBand::Consolidated);
    }
}
