//! HTTP transport for both upstream services.
//!
//! Plain JSON over REST with optional bearer auth. Rate limiting (429),
//! 5xx responses and connection failures are retried with exponential
//! backoff plus jitter; once the budget is spent the call fails with
//! [`ApiError::Unavailable`] so callers can fall back to local data.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, HistoricalMonth, RemoteHistoricalService, RemoteTodayService};
use crate::config::RetryConfig;
use crate::models::{ActorKind, DayRecord, Direction, PersonId, TodayEvent, TodayKey, YearMonth};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayRecordDto {
    event_instant: NaiveDateTime,
    deviation_seconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalMonthDto {
    #[serde(default)]
    entries: BTreeMap<u32, DayRecordDto>,
    #[serde(default)]
    exits: BTreeMap<u32, DayRecordDto>,
    refreshed_at: Option<NaiveDateTime>,
}

impl HistoricalMonthDto {
    fn into_month(self) -> HistoricalMonth {
        let convert = |direction: Direction, days: BTreeMap<u32, DayRecordDto>| {
            days.into_iter()
                .map(|(day, dto)| (day, DayRecord::new(direction, dto.event_instant, dto.deviation_seconds)))
                .collect()
        };
        HistoricalMonth {
            entries: convert(Direction::CheckIn, self.entries),
            exits: convert(Direction::CheckOut, self.exits),
            refreshed_at: self.refreshed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodayEventDto {
    person_id: PersonId,
    direction: Direction,
    /// Falls back to the date of `event_instant` when omitted.
    day: Option<NaiveDate>,
    #[serde(default)]
    sub_key: Option<String>,
    event_instant: NaiveDateTime,
    deviation_seconds: i64,
}

impl TodayEventDto {
    fn into_event(self) -> TodayEvent {
        let day = self.day.unwrap_or_else(|| self.event_instant.date());
        let mut key = TodayKey::new(self.person_id, self.direction, day);
        key.sub_key = self.sub_key;
        TodayEvent::new(key, self.event_instant, self.deviation_seconds)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    direction: Direction,
    person_id: &'a PersonId,
    expected_time: NaiveDateTime,
}

#[derive(Debug, Deserialize)]
struct RetractResponse {
    removed: bool,
}

// ============================================================================
// Client
// ============================================================================

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    token: Option<String>,
    retry: RetryConfig,
}

impl HttpRemote {
    pub fn new(base_url: &str, retry: &RetryConfig) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid remote base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Remote base URL cannot carry a path: {}", base_url);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(retry.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: None,
            retry: retry.clone(),
        })
    }

    /// Same connection pool, different credentials.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
            retry: self.retry.clone(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ApiError::InvalidResponse(format!("base URL cannot carry a path: {}", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send the request built by `build`, retrying transient failures.
    async fn send<F>(&self, url: &Url, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        let mut backoff_ms = self.retry.initial_backoff_ms;

        loop {
            let error = match self.authorize(build()).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    ApiError::from_status(status, &body)
                }
                Err(e) => ApiError::NetworkError(e),
            };

            if !error.is_transient() {
                return Err(error);
            }
            retries += 1;
            if retries > self.retry.max_retries {
                warn!(url = %url, retries = self.retry.max_retries, error = %error, "Retries exhausted");
                return Err(ApiError::Unavailable(format!(
                    "{} (after {} retries)",
                    error, self.retry.max_retries
                )));
            }
            let delay_ms = jittered(backoff_ms);
            warn!(url = %url, retry = retries, backoff_ms = delay_ms, error = %error, "Transient failure, backing off");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            backoff_ms = next_backoff(backoff_ms, self.retry.max_backoff_ms);
        }
    }

    async fn parse<T: DeserializeOwned>(url: &Url, response: reqwest::Response) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
    }
}

/// Add up to 25% random jitter to a backoff delay.
fn jittered(backoff_ms: u64) -> u64 {
    backoff_ms.saturating_add(rand::thread_rng().gen_range(0..=backoff_ms / 4))
}

fn next_backoff(backoff_ms: u64, max_backoff_ms: u64) -> u64 {
    backoff_ms.saturating_mul(2).min(max_backoff_ms)
}

#[async_trait]
impl RemoteHistoricalService for HttpRemote {
    async fn fetch_month(
        &self,
        person: &PersonId,
        role: ActorKind,
        month: YearMonth,
    ) -> Result<Option<HistoricalMonth>, ApiError> {
        let month_segment = month.to_string();
        let url = self.endpoint(&["attendance", role.as_str(), person.as_str(), &month_segment])?;
        debug!(url = %url, "Fetching monthly history");

        match self.send(&url, || self.client.get(url.clone())).await {
            Ok(response) => {
                let dto: HistoricalMonthDto = Self::parse(&url, response).await?;
                Ok(Some(dto.into_month()))
            }
            Err(ApiError::NotFound(_)) => {
                debug!(url = %url, "No history upstream");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteTodayService for HttpRemote {
    async fn register(
        &self,
        direction: Direction,
        person: &PersonId,
        expected_time: NaiveDateTime,
    ) -> Result<TodayEvent, ApiError> {
        let url = self.endpoint(&["today", "events"])?;
        let body = RegisterRequest {
            direction,
            person_id: person,
            expected_time,
        };
        let response = self
            .send(&url, || self.client.post(url.clone()).json(&body))
            .await?;
        let dto: TodayEventDto = Self::parse(&url, response).await?;
        Ok(dto.into_event())
    }

    async fn query_today(
        &self,
        actor_kind: ActorKind,
        direction: Direction,
    ) -> Result<Vec<TodayEvent>, ApiError> {
        let url = self.endpoint(&["today", "events"])?;
        let query = [("actorKind", actor_kind.as_str()), ("direction", direction.as_str())];
        let response = self
            .send(&url, || self.client.get(url.clone()).query(&query))
            .await?;
        let dtos: Vec<TodayEventDto> = Self::parse(&url, response).await?;
        debug!(url = %url, events = dtos.len(), "Polled today service");
        Ok(dtos.into_iter().map(TodayEventDto::into_event).collect())
    }

    async fn retract(
        &self,
        person: &PersonId,
        direction: Direction,
        sub_key: Option<&str>,
    ) -> Result<bool, ApiError> {
        let url = self.endpoint(&["today", "events", person.as_str(), direction.as_str()])?;
        let response = self
            .send(&url, || {
                let request = self.client.delete(url.clone());
                match sub_key {
                    Some(sub) => request.query(&[("subKey", sub)]),
                    None => request,
                }
            })
            .await?;
        let ack: RetractResponse = Self::parse(&url, response).await?;
        Ok(ack.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceStatus;

    #[test]
    fn test_parse_historical_month() {
        let json = r#"{
            "entries": {
                "2": {"eventInstant": "2025-06-02T08:05:00", "deviationSeconds": 300},
                "3": {"eventInstant": "2025-06-03T07:55:00", "deviationSeconds": -300}
            },
            "exits": {
                "2": {"eventInstant": "2025-06-02T15:30:00", "deviationSeconds": -1800}
            },
            "refreshedAt": "2025-06-10T08:00:00"
        }"#;
        let dto: HistoricalMonthDto = serde_json::from_str(json).expect("Failed to parse history JSON");
        let month = dto.into_month();
        assert_eq!(month.entries.len(), 2);
        assert_eq!(month.entries[&2].status, AttendanceStatus::Late);
        assert_eq!(month.entries[&3].status, AttendanceStatus::OnTime);
        assert_eq!(month.exits[&2].status, AttendanceStatus::EarlyLeave);
        assert!(month.refreshed_at.is_some());
    }

    #[test]
    fn test_parse_empty_historical_month() {
        let dto: HistoricalMonthDto = serde_json::from_str(r#"{"refreshedAt": null}"#).unwrap();
        let month = dto.into_month();
        assert!(month.entries.is_empty());
        assert!(month.exits.is_empty());
    }

    #[test]
    fn test_parse_today_event_defaults_day() {
        let json = r#"{
            "personId": "p-1",
            "direction": "check_out",
            "eventInstant": "2025-06-10T16:10:00",
            "deviationSeconds": 600
        }"#;
        let dto: TodayEventDto = serde_json::from_str(json).unwrap();
        let event = dto.into_event();
        assert_eq!(event.key.day, NaiveDate::from_ymd_opt(2025, 6, 10).unwrap());
        assert_eq!(event.key.direction, Direction::CheckOut);
        assert_eq!(event.key.sub_key, None);
        assert_eq!(event.status, AttendanceStatus::OnTime);
    }

    #[test]
    fn test_register_request_shape() {
        let person = PersonId::new("p-1");
        let body = RegisterRequest {
            direction: Direction::CheckIn,
            person_id: &person,
            expected_time: NaiveDate::from_ymd_opt(2025, 6, 10)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["personId"], "p-1");
        assert_eq!(value["direction"], "check_in");
        assert_eq!(value["expectedTime"], "2025-06-10T08:00:00");
    }

    #[test]
    fn test_endpoint_building() {
        let remote = HttpRemote::new("https://attendance.example.org/api/", &RetryConfig::default()).unwrap();
        let url = remote.endpoint(&["attendance", "staff", "p 1", "2025-06"]).unwrap();
        assert_eq!(url.as_str(), "https://attendance.example.org/api/attendance/staff/p%201/2025-06");

        let bare = HttpRemote::new("https://attendance.example.org", &RetryConfig::default()).unwrap();
        assert_eq!(
            bare.endpoint(&["today", "events"]).unwrap().as_str(),
            "https://attendance.example.org/today/events"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(HttpRemote::new("not a url", &RetryConfig::default()).is_err());
        assert!(HttpRemote::new("mailto:someone@example.org", &RetryConfig::default()).is_err());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let delay = jittered(1000);
            assert!((1000..=1250).contains(&delay));
        }
        assert_eq!(jittered(0), 0);
    }

    #[test]
    fn test_backoff_saturates_on_huge_config() {
        assert_eq!(next_backoff(500, 8_000), 1_000);
        assert_eq!(next_backoff(6_000, 8_000), 8_000);
        assert_eq!(next_backoff(u64::MAX / 2 + 1, u64::MAX), u64::MAX);
        assert_eq!(jittered(u64::MAX), u64::MAX);
    }
}
