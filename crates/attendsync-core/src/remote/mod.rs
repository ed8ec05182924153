//! Upstream attendance services.
//!
//! Two services sit behind the engine: the historical service, which owns
//! consolidated monthly records, and the today service, which sees events
//! as they happen. Both are traits so the orchestrator can be driven by
//! the HTTP transport, the offline stand-in, or test fakes.

pub mod error;
pub mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::models::{ActorKind, DayRecord, Direction, PersonId, TodayEvent, YearMonth};

pub use error::ApiError;
pub use http::HttpRemote;

/// One month of consolidated history for both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoricalMonth {
    pub entries: BTreeMap<u32, DayRecord>,
    pub exits: BTreeMap<u32, DayRecord>,
    pub refreshed_at: Option<NaiveDateTime>,
}

#[async_trait]
pub trait RemoteHistoricalService: Send + Sync {
    /// The full month, or `None` when upstream has nothing for it.
    async fn fetch_month(
        &self,
        person: &PersonId,
        role: ActorKind,
        month: YearMonth,
    ) -> Result<Option<HistoricalMonth>, ApiError>;
}

#[async_trait]
pub trait RemoteTodayService: Send + Sync {
    /// Register an event; the echo carries the computed deviation.
    async fn register(
        &self,
        direction: Direction,
        person: &PersonId,
        expected_time: NaiveDateTime,
    ) -> Result<TodayEvent, ApiError>;

    /// Every event of today for `actor_kind` in `direction`.
    async fn query_today(
        &self,
        actor_kind: ActorKind,
        direction: Direction,
    ) -> Result<Vec<TodayEvent>, ApiError>;

    /// Returns whether anything was removed.
    async fn retract(
        &self,
        person: &PersonId,
        direction: Direction,
        sub_key: Option<&str>,
    ) -> Result<bool, ApiError>;
}

/// Stand-in used when no endpoint is configured. Every call reports the
/// service as unavailable so resolves fall back to local data.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineRemote;

const OFFLINE_REASON: &str = "no remote endpoint configured";

#[async_trait]
impl RemoteHistoricalService for OfflineRemote {
    async fn fetch_month(
        &self,
        _person: &PersonId,
        _role: ActorKind,
        _month: YearMonth,
    ) -> Result<Option<HistoricalMonth>, ApiError> {
        Err(ApiError::Unavailable(OFFLINE_REASON.to_string()))
    }
}

#[async_trait]
impl RemoteTodayService for OfflineRemote {
    async fn register(
        &self,
        _direction: Direction,
        _person: &PersonId,
        _expected_time: NaiveDateTime,
    ) -> Result<TodayEvent, ApiError> {
        Err(ApiError::Unavailable(OFFLINE_REASON.to_string()))
    }

    async fn query_today(
        &self,
        _actor_kind: ActorKind,
        _direction: Direction,
    ) -> Result<Vec<TodayEvent>, ApiError> {
        Err(ApiError::Unavailable(OFFLINE_REASON.to_string()))
    }

    async fn retract(
        &self,
        _person: &PersonId,
        _direction: Direction,
        _sub_key: Option<&str>,
    ) -> Result<bool, ApiError> {
        Err(ApiError::Unavailable(OFFLINE_REASON.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_remote_is_unavailable() {
        let remote = OfflineRemote;
        let month = YearMonth::new(2025, 6).unwrap();
        let err = remote
            .fetch_month(&PersonId::new("p"), ActorKind::Staff, month)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        let err = remote
            .query_today(ActorKind::Student, Direction::CheckIn)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
