use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::calendar::{is_school_day, YearMonth};

/// Opaque person identifier as issued by the remote services.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as one storage-key segment: `%` and `/` are percent-encoded so
    /// no id can reach into another id's prefix.
    pub fn key_segment(&self) -> Cow<'_, str> {
        if !self.0.contains(|c| c == '%' || c == '/') {
            return Cow::Borrowed(&self.0);
        }
        Cow::Owned(self.0.replace('%', "%25").replace('/', "%2F"))
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Direction {
    CheckIn,
    CheckOut,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::CheckIn, Direction::CheckOut];

    /// Short form used in storage keys and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::CheckIn => "in",
            Direction::CheckOut => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::CheckIn => write!(f, "Check-in"),
            Direction::CheckOut => write!(f, "Check-out"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "check_in" | "checkin" | "entry" => Ok(Direction::CheckIn),
            "out" | "check_out" | "checkout" | "exit" => Ok(Direction::CheckOut),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Which population a person belongs to. Passed to the historical service
/// as the role and to the today service as the actor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    #[default]
    Staff,
    Student,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Staff => "staff",
            ActorKind::Student => "student",
        }
    }
}

impl FromStr for ActorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "staff" => Ok(ActorKind::Staff),
            "student" => Ok(ActorKind::Student),
            other => Err(format!("unknown actor kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AttendanceStatus {
    OnTime,
    Late,
    EarlyLeave,
}

impl AttendanceStatus {
    /// Derive the status from the signed deviation against the expected
    /// schedule. Check-in after schedule is late, check-out before it is
    /// an early leave.
    pub fn classify(direction: Direction, deviation_seconds: i64) -> Self {
        match direction {
            Direction::CheckIn if deviation_seconds > 0 => AttendanceStatus::Late,
            Direction::CheckOut if deviation_seconds < 0 => AttendanceStatus::EarlyLeave,
            _ => AttendanceStatus::OnTime,
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceStatus::OnTime => write!(f, "On time"),
            AttendanceStatus::Late => write!(f, "Late"),
            AttendanceStatus::EarlyLeave => write!(f, "Early leave"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DayRecord {
    pub event_instant: NaiveDateTime,
    pub deviation_seconds: i64,
    pub status: AttendanceStatus,
}

impl DayRecord {
    pub fn new(direction: Direction, event_instant: NaiveDateTime, deviation_seconds: i64) -> Self {
        Self {
            event_instant,
            deviation_seconds,
            status: AttendanceStatus::classify(direction, deviation_seconds),
        }
    }

    /// Recompute the status; used when records arrive from upstream so a
    /// disagreeing wire value can't leak in.
    pub fn normalized(mut self, direction: Direction) -> Self {
        self.status = AttendanceStatus::classify(direction, self.deviation_seconds);
        self
    }
}

/// Identity of one monthly aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub person: PersonId,
    pub direction: Direction,
    pub month: YearMonth,
}

impl AggregateKey {
    pub fn new(person: PersonId, direction: Direction, month: YearMonth) -> Self {
        Self {
            person,
            direction,
            month,
        }
    }

    /// Storage key. Person first, then month, so one prefix scan finds both
    /// directions of a (person, month) pair.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", Self::pair_prefix(&self.person, self.month), self.direction.as_str())
    }

    pub fn pair_prefix(person: &PersonId, month: YearMonth) -> String {
        format!("{}/{}", person.key_segment(), month)
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct MonthlyAggregate {
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub person: PersonId,
    pub direction: Direction,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub month: YearMonth,
    pub days: BTreeMap<u32, DayRecord>,
    pub last_refreshed_at: NaiveDateTime,
}

impl MonthlyAggregate {
    pub fn empty(key: &AggregateKey, refreshed_at: NaiveDateTime) -> Self {
        Self {
            person: key.person.clone(),
            direction: key.direction,
            month: key.month,
            days: BTreeMap::new(),
            last_refreshed_at: refreshed_at,
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(self.person.clone(), self.direction, self.month)
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn has_day(&self, day: u32) -> bool {
        self.days.contains_key(&day)
    }

    pub fn has_date(&self, date: NaiveDate) -> bool {
        self.month.contains(date) && self.has_day(chrono::Datelike::day(&date))
    }

    /// Advance `last_refreshed_at`, never moving it backwards.
    pub fn touch(&mut self, now: NaiveDateTime) {
        if now > self.last_refreshed_at {
            self.last_refreshed_at = now;
        }
    }

    /// Days recorded on a school day strictly before `today`.
    pub fn school_days_before(&self, today: NaiveDate) -> usize {
        self.days
            .keys()
            .filter_map(|&d| self.month.day(d))
            .filter(|date| *date < today && is_school_day(*date))
            .count()
    }

    /// Drop keys that are not days of this month. Returns how many were dropped.
    pub fn retain_valid_days(&mut self) -> usize {
        let month = self.month;
        let before = self.days.len();
        self.days.retain(|&day, _| month.is_valid_day(day));
        before - self.days.len()
    }
}
