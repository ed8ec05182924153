//! attendsync - command-line driver for the attendance consistency engine.
//!
//! Wires the core together from the user's configuration and prints
//! results as JSON on stdout. Logs go to stderr (and optionally a daily
//! log file); set `RUST_LOG` to change the level.

use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use attendsync_core::models::{Direction, PersonId, YearMonth};
use attendsync_core::policy::TemporalPolicy;
use attendsync_core::store::spawn_expiry_sweeper;
use attendsync_core::{
    ClockSource, Config, EphemeralTodayCache, HttpRemote, JsonFileStore, LocalAggregateStore,
    MonthlyAggregate, OfflineRemote, RemoteHistoricalService, RemoteTodayService, SyncOrchestrator,
    SystemClock, TodayEvent,
};
use chrono::NaiveTime;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Overrides `base_url` from the config file.
const BASE_URL_ENV: &str = "ATTENDSYNC_BASE_URL";

/// Bearer token for the remote services.
const TOKEN_ENV: &str = "ATTENDSYNC_TOKEN";

const LOG_FILE_PREFIX: &str = "attendsync.log";

const USAGE: &str = "\
Usage:
  attendsync resolve <person> <YYYY-MM>
  attendsync record <person> <in|out> <HH:MM>
  attendsync retract <person> <in|out> [sub-key]
  attendsync sweep [--watch]
  attendsync init-config";

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Everything a command needs, built from configuration.
struct Engine {
    clock: Arc<dyn ClockSource>,
    today: Arc<EphemeralTodayCache>,
    sync: SyncOrchestrator,
}

fn remotes(config: &Config) -> Result<(Arc<dyn RemoteHistoricalService>, Arc<dyn RemoteTodayService>)> {
    let base_url = std::env::var(BASE_URL_ENV).ok().or_else(|| config.base_url.clone());
    let Some(base_url) = base_url else {
        warn!("No remote endpoint configured, running offline");
        let history: Arc<dyn RemoteHistoricalService> = Arc::new(OfflineRemote);
        let today: Arc<dyn RemoteTodayService> = Arc::new(OfflineRemote);
        return Ok((history, today));
    };

    let mut remote = HttpRemote::new(&base_url, &config.retry)?;
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        remote = remote.with_token(token);
    }
    let remote = Arc::new(remote);
    let history: Arc<dyn RemoteHistoricalService> = remote.clone();
    let today: Arc<dyn RemoteTodayService> = remote;
    Ok((history, today))
}

fn build_engine(config: &Config) -> Result<Engine> {
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let cache_dir = config.cache_dir()?;

    let aggregate_store = Arc::new(
        JsonFileStore::<MonthlyAggregate>::open(&cache_dir, "aggregates")
            .context("Failed to open aggregate store")?,
    );
    let today_store = Arc::new(
        JsonFileStore::<TodayEvent>::open(&cache_dir, "today").context("Failed to open same-day store")?,
    );

    let aggregates = Arc::new(LocalAggregateStore::new(aggregate_store, clock.clone()));
    let today = Arc::new(EphemeralTodayCache::new(
        today_store,
        clock.clone(),
        config.today_cache.clone(),
    ));
    let (history, today_service) = remotes(config)?;

    let sync = SyncOrchestrator::new(
        clock.clone(),
        TemporalPolicy::new(config.policy.clone()),
        aggregates,
        today.clone(),
        history,
        today_service,
    )
    .with_actor_kind(config.actor_kind);

    Ok(Engine { clock, today, sync })
}

fn parse_direction(s: &str) -> Result<Direction> {
    Direction::from_str(s).map_err(|e| anyhow::anyhow!(e))
}

// ============================================================================
// Commands
// ============================================================================

async fn resolve(engine: &Engine, person: &str, month: &str) -> Result<()> {
    let month = YearMonth::from_str(month).map_err(|e| anyhow::anyhow!(e))?;
    let result = engine
        .sync
        .resolve_attendance(&PersonId::new(person), month)
        .await?;
    print_json(&result)
}

async fn record(engine: &Engine, person: &str, direction: &str, time: &str) -> Result<()> {
    let direction = parse_direction(direction)?;
    let time = NaiveTime::parse_from_str(time, "%H:%M")
        .with_context(|| format!("Invalid time '{}', expected HH:MM", time))?;
    let expected = engine.clock.now().date().and_time(time);
    let event = engine
        .sync
        .record_event(&PersonId::new(person), direction, expected)
        .await?;
    print_json(&event)
}

async fn retract(engine: &Engine, person: &str, direction: &str, sub_key: Option<&str>) -> Result<()> {
    let direction = parse_direction(direction)?;
    let removed = engine
        .sync
        .retract_event(&PersonId::new(person), direction, sub_key)
        .await?;
    print_json(&serde_json::json!({ "removed": removed }))
}

async fn sweep(engine: &Engine, watch: bool) -> Result<()> {
    if !watch {
        let removed = engine.today.purge_expired()?;
        return print_json(&serde_json::json!({ "removed": removed }));
    }

    let interval = engine.today.config().sweep_interval();
    info!(interval_secs = interval.as_secs(), "Running expiry sweeper");
    spawn_expiry_sweeper(engine.today.clone(), interval)
        .await
        .context("Expiry sweeper stopped")?;
    Ok(())
}

fn init_config(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    if path.exists() {
        println!("Config already exists at {}", path.display());
    } else {
        config.save()?;
        println!("Wrote default config to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let args: Vec<String> = std::env::args().collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = args.get(1..).unwrap_or_default();

    if let ["init-config"] = *command {
        return init_config(&config);
    }

    let engine = build_engine(&config)?;
    match *command {
        ["resolve", person, month] => resolve(&engine, person, month).await,
        ["record", person, direction, time] => record(&engine, person, direction, time).await,
        ["retract", person, direction] => retract(&engine, person, direction, None).await,
        ["retract", person, direction, sub_key] => retract(&engine, person, direction, Some(sub_key)).await,
        ["sweep"] => sweep(&engine, false).await,
        ["sweep", "--watch"] => sweep(&engine, true).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}
