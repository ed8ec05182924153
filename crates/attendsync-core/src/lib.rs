//! attendsync-core: offline-first attendance consistency engine.
//!
//! Answers "attendance of person X in month M" from a local cache of
//! monthly aggregates, consulting the upstream historical and same-day
//! services only when the time of day, the day of week and the age of the
//! local data say it may be stale.
//!
//! - [`policy`]: pure time-band and freshness rules
//! - [`store`]: aggregate store and expiring same-day cache
//! - [`validator`]: entry/exit consistency check
//! - [`remote`]: upstream service traits and the HTTP transport
//! - [`sync`]: the orchestrator tying it all together

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod policy;
pub mod remote;
pub mod store;
pub mod sync;
pub mod validator;

pub use clock::{ClockSource, FixedClock, SystemClock};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use models::{
    ActorKind, AggregateKey, AttendanceStatus, DayRecord, Direction, MonthlyAggregate, PersonId,
    TodayEvent, TodayKey, YearMonth,
};
pub use policy::{TemporalPolicy, TimeBand};
pub use remote::{ApiError, HttpRemote, OfflineRemote, RemoteHistoricalService, RemoteTodayService};
pub use store::{EphemeralTodayCache, JsonFileStore, KeyedStore, LocalAggregateStore, MemoryStore};
pub use sync::{AttendanceResult, SessionReporter, SyncOrchestrator, SyncSource};
pub use validator::{check_pair_sync, PairCheck};
