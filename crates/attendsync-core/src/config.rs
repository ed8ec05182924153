//! Application configuration management.
//!
//! This module handles loading and saving the engine configuration: the
//! remote endpoint, the policy constants (time bands, cooldown), the today
//! cache lifetimes and the transport retry budget.
//!
//! Configuration is stored at `~/.config/attendsync/config.json`. Every
//! field has a default, so a partial or missing file is fine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::{ActorKind, Direction};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "attendsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Base URL of the attendance API. `None` means offline only.
    pub base_url: Option<String>,
    /// Cache namespace, so several accounts don't share aggregates.
    pub profile: Option<String>,
    pub actor_kind: ActorKind,
    /// Directory for a rolling log file; logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub policy: PolicyConfig,
    pub today_cache: TodayCacheConfig,
    pub retry: RetryConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.policy.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;

        let mut path = cache_dir.join(APP_NAME);
        if let Some(ref profile) = self.profile {
            path = path.join(profile);
        }
        Ok(path)
    }
}

/// Constants of the temporal policy. Defaults reproduce the production
/// schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Before this hour nothing new can exist upstream.
    pub checkin_window_start_hour: u32,
    /// From this hour both directions are polled.
    pub full_window_start_hour: u32,
    /// From this hour the day is folded into the historical service.
    pub consolidated_start_hour: u32,
    /// A Friday refresh at or after this hour carries the week over the weekend.
    pub friday_end_of_day_hour: u32,
    /// Rate-limit cooldown within one time band.
    pub poll_cooldown_minutes: i64,
    /// How many trailing school days the coverage check inspects.
    pub coverage_school_days: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            checkin_window_start_hour: 7,
            full_window_start_hour: 12,
            consolidated_start_hour: 19,
            friday_end_of_day_hour: 19,
            poll_cooldown_minutes: 45,
            coverage_school_days: 3,
        }
    }
}

impl PolicyConfig {
    pub fn poll_cooldown(&self) -> Duration {
        Duration::minutes(self.poll_cooldown_minutes)
    }

    pub fn validate(&self) -> Result<()> {
        let ordered = self.checkin_window_start_hour <= self.full_window_start_hour
            && self.full_window_start_hour <= self.consolidated_start_hour
            && self.consolidated_start_hour <= 24
            && self.friday_end_of_day_hour <= 24;
        if !ordered {
            anyhow::bail!(
                "time band hours must be ascending and within a day (got {}/{}/{})",
                self.checkin_window_start_hour,
                self.full_window_start_hour,
                self.consolidated_start_hour
            );
        }
        if self.poll_cooldown_minutes < 0 {
            anyhow::bail!("poll cooldown cannot be negative");
        }
        Ok(())
    }
}

/// Lifetimes of same-day events, per record kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TodayCacheConfig {
    pub check_in_max_age_minutes: i64,
    pub check_out_max_age_minutes: i64,
    /// Interval of the background expiry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for TodayCacheConfig {
    fn default() -> Self {
        Self {
            check_in_max_age_minutes: 12 * 60,
            check_out_max_age_minutes: 6 * 60,
            sweep_interval_secs: 15 * 60,
        }
    }
}

impl TodayCacheConfig {
    pub fn max_age(&self, direction: Direction) -> Duration {
        match direction {
            Direction::CheckIn => Duration::minutes(self.check_in_max_age_minutes),
            Direction::CheckOut => Duration::minutes(self.check_out_max_age_minutes),
        }
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Transport retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            request_timeout_secs: 30,
        }
    }
}
