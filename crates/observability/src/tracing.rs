//! Tracing/logging initialization.
//!
//! Console output is always installed. Long-running fetch runs can also mirror
//! every event into a daily log file under a log directory.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Initialize console logging plus a daily-rolling file `<name>.<date>.log`
/// inside `log_dir`.
///
/// The returned guard flushes buffered file output when dropped; keep it alive
/// for the lifetime of the process. If a global subscriber is already set the
/// file layer is not installed, but the guard is still returned.
pub fn init_with_log_dir(log_dir: impl AsRef<Path>, name: &str) -> anyhow::Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory at {:?}", log_dir))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .filename_suffix("log")
        .build(log_dir)
        .with_context(|| format!("failed to create rolling log file in {:?}", log_dir))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();

    match installed {
        Ok(()) => ::tracing::info!(log = name, dir = ?log_dir, "logging configured"),
        Err(_) => ::tracing::debug!(log = name, "global subscriber already set; file logging skipped"),
    }

    Ok(guard)
}
