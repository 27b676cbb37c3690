//! Sync configuration.
//!
//! Defaults match the on-disk layout used by the ingestion scripts. Every
//! field can be overridden from `TUBESYNC_*` environment variables, after
//! loading a `.env` file if one is present.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use tubesync_core::{SyncError, SyncResult};

use crate::daemon::DEFAULT_FLUSH_INTERVAL;
use crate::fetch::{DEFAULT_RATE_LIMIT_PAUSE, DEFAULT_WORKERS, FetchPoolConfig};
use crate::retry::{BackoffSchedule, DEFAULT_MAX_ATTEMPTS, DEFAULT_WAITS_SECS};

const ENV_PREFIX: &str = "TUBESYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry_cache_path: PathBuf,
    pub cursor_path: PathBuf,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub backoff_secs: Vec<u64>,
    pub flush_interval_secs: u64,
    pub rate_limit_pause_secs: u64,
    pub unavailable_is_terminal: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_cache_path: PathBuf::from("output/failed_transcripts.json"),
            cursor_path: PathBuf::from("output/cache.json"),
            max_workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_secs: DEFAULT_WAITS_SECS.to_vec(),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            rate_limit_pause_secs: DEFAULT_RATE_LIMIT_PAUSE.as_secs(),
            unavailable_is_terminal: false,
        }
    }
}

impl SyncConfig {
    /// Defaults, overridden by `.env` and then by the process environment.
    pub fn from_env() -> SyncResult<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults, overridden by whatever `lookup` returns for each `TUBESYNC_*` key.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = var("RETRY_CACHE_PATH") {
            config.retry_cache_path = PathBuf::from(v);
        }
        if let Some(v) = var("CURSOR_PATH") {
            config.cursor_path = PathBuf::from(v);
        }
        if let Some(v) = var("MAX_WORKERS") {
            config.max_workers = parse_var("MAX_WORKERS", &v)?;
        }
        if let Some(v) = var("MAX_ATTEMPTS") {
            config.max_attempts = parse_var("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("BACKOFF_SECS") {
            config.backoff_secs = v
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse_var("BACKOFF_SECS", part))
                .collect::<SyncResult<_>>()?;
        }
        if let Some(v) = var("FLUSH_INTERVAL_SECS") {
            config.flush_interval_secs = parse_var("FLUSH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("RATE_LIMIT_PAUSE_SECS") {
            config.rate_limit_pause_secs = parse_var("RATE_LIMIT_PAUSE_SECS", &v)?;
        }
        if let Some(v) = var("UNAVAILABLE_IS_TERMINAL") {
            config.unavailable_is_terminal = parse_bool("UNAVAILABLE_IS_TERMINAL", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.max_workers == 0 {
            return Err(SyncError::validation("max_workers must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::validation("max_attempts must be at least 1"));
        }
        if self.backoff_secs.is_empty() {
            return Err(SyncError::validation("backoff schedule cannot be empty"));
        }
        if self.flush_interval_secs == 0 {
            return Err(SyncError::validation("flush interval must be positive"));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn rate_limit_pause(&self) -> Duration {
        Duration::from_secs(self.rate_limit_pause_secs)
    }

    pub fn backoff_schedule(&self) -> SyncResult<BackoffSchedule> {
        BackoffSchedule::from_secs(&self.backoff_secs, self.max_attempts)
    }

    pub fn pool_config(&self) -> FetchPoolConfig {
        FetchPoolConfig::default()
            .with_workers(self.max_workers)
            .with_rate_limit_pause(self.rate_limit_pause())
            .with_unavailable_terminal(self.unavailable_is_terminal)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> SyncResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::validation(format!("{ENV_PREFIX}{name}: invalid value {raw:?}")))
}

fn parse_bool(name: &str, raw: &str) -> SyncResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::validation(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got {raw:?}"
        ))),
    }
}
