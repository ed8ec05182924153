use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::attendance::{AttendanceStatus, DayRecord, Direction, PersonId};

/// Business key of a same-day event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayKey {
    pub person: PersonId,
    pub direction: Direction,
    pub day: NaiveDate,
    /// Optional disambiguator (shift, terminal) when one person can have
    /// several events of the same direction on one day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_key: Option<String>,
}

impl TodayKey {
    pub fn new(person: PersonId, direction: Direction, day: NaiveDate) -> Self {
        Self {
            person,
            direction,
            day,
            sub_key: None,
        }
    }

    pub fn with_sub_key(mut self, sub_key: impl Into<String>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }

    /// Storage key. Date first so everything before a date is one key range,
    /// then person so a person's events for a day share a prefix.
    pub fn storage_key(&self) -> String {
        let base = format!(
            "{}/{}",
            Self::person_day_prefix(&self.person, self.day),
            self.direction.as_str()
        );
        match &self.sub_key {
            Some(sub) => format!("{}/{}", base, sub),
            None => base,
        }
    }

    pub fn person_day_prefix(person: &PersonId, day: NaiveDate) -> String {
        format!("{}/{}", Self::day_prefix(day), person.key_segment())
    }

    pub fn day_prefix(day: NaiveDate) -> String {
        day.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayEvent {
    pub key: TodayKey,
    pub event_instant: NaiveDateTime,
    pub deviation_seconds: i64,
    pub status: AttendanceStatus,
    pub fetched_at: NaiveDateTime,
}

impl TodayEvent {
    pub fn new(key: TodayKey, event_instant: NaiveDateTime, deviation_seconds: i64) -> Self {
        let status = AttendanceStatus::classify(key.direction, deviation_seconds);
        Self {
            key,
            event_instant,
            deviation_seconds,
            status,
            fetched_at: event_instant,
        }
    }

    pub fn day_of_month(&self) -> u32 {
        self.key.day.day()
    }

    pub fn to_day_record(&self) -> DayRecord {
        DayRecord::new(self.key.direction, self.event_instant, self.deviation_seconds)
    }
}
