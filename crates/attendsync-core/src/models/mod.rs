//! Data models for attendance tracking.
//!
//! This module contains the data structures shared by the caches, the
//! policy engine and the orchestrator:
//!
//! - `MonthlyAggregate`, `DayRecord`: durable per-month attendance
//! - `TodayEvent`, `TodayKey`: short-lived same-day events
//! - `YearMonth`, `PersonId`, `Direction`, `ActorKind`: identifiers

pub mod attendance;
pub mod calendar;
pub mod today;

pub use attendance::{
    ActorKind, AggregateKey, AttendanceStatus, DayRecord, Direction, MonthlyAggregate, PersonId,
};
pub use calendar::{is_school_day, YearMonth};
pub use today::{TodayEvent, TodayKey};
