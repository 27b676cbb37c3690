//! Background persistence daemon.
//!
//! Periodically flushes in-memory state (the retry cache, and anything else
//! implementing [`Flush`]) to durable storage, and performs one final flush on
//! shutdown. The caller owns the lifecycle: nothing is spawned until
//! [`PersistenceDaemon::start`] is called, and [`DaemonHandle::stop`] (or
//! dropping the handle) stops the thread after the final flush.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use tubesync_core::{SyncError, SyncResult};

/// Default time between periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Timer tick; targets may skip writing unchanged state.
    Periodic,
    /// Shutdown; targets must write.
    Final,
}

/// Something whose in-memory state can be written to durable storage.
pub trait Flush: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Write current state. Returns whether anything was written.
    fn flush(&self, reason: FlushReason) -> SyncResult<bool>;
}

impl<F: Flush + ?Sized> Flush for Arc<F> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn flush(&self, reason: FlushReason) -> SyncResult<bool> {
        (**self).flush(reason)
    }
}

/// Daemon runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DaemonStats {
    pub cycles: u64,
    pub writes: u64,
    pub failures: u64,
    pub uptime_secs: u64,
}

/// Periodic flusher configuration + targets.
pub struct PersistenceDaemon {
    name: String,
    interval: Duration,
    targets: Vec<Arc<dyn Flush>>,
}

impl PersistenceDaemon {
    /// Create a daemon flushing every `interval`, which must be non-zero.
    pub fn new(interval: Duration) -> SyncResult<Self> {
        if interval.is_zero() {
            return Err(SyncError::validation("flush interval must be positive"));
        }
        Ok(Self {
            name: "persistence-daemon".to_string(),
            interval,
            targets: Vec::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a flush target.
    pub fn with_target(mut self, target: Arc<dyn Flush>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the daemon thread.
    pub fn start(self) -> SyncResult<DaemonHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(DaemonStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || daemon_loop(self, shutdown_rx, stats_clone))
            .map_err(|e| SyncError::io("persistence-daemon thread", e))?;

        Ok(DaemonHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        })
    }
}

/// Handle to control a running daemon.
///
/// Dropping the handle behaves like [`DaemonHandle::stop`], so state is
/// flushed on any normal exit path that unwinds the owner.
#[derive(Debug)]
pub struct DaemonHandle {
    shutdown: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DaemonStats>>,
}

impl DaemonHandle {
    /// Stop the daemon, waiting for its final flush to complete.
    pub fn stop(mut self) -> DaemonStats {
        self.shutdown_and_join();
        self.stats()
    }

    /// Get current daemon statistics.
    pub fn stats(&self) -> DaemonStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn shutdown_and_join(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("persistence daemon thread panicked");
            }
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn daemon_loop(
    daemon: PersistenceDaemon,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<DaemonStats>>,
) {
    info!(
        daemon = %daemon.name,
        interval_ms = daemon.interval.as_millis() as u64,
        targets = daemon.targets.len(),
        "persistence daemon started"
    );
    let start_time = Instant::now();

    loop {
        match shutdown_rx.recv_timeout(daemon.interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush_all(&daemon, FlushReason::Periodic, &stats);
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.cycles += 1;
                s.uptime_secs = start_time.elapsed().as_secs();
            }
            // Explicit stop, or the handle went away.
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    flush_all(&daemon, FlushReason::Final, &stats);
    stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .uptime_secs = start_time.elapsed().as_secs();

    info!(daemon = %daemon.name, "persistence daemon stopped");
}

fn flush_all(daemon: &PersistenceDaemon, reason: FlushReason, stats: &Mutex<DaemonStats>) {
    for target in &daemon.targets {
        let result = target.flush(reason);
        let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(true) => s.writes += 1,
            Ok(false) => {
                debug!(daemon = %daemon.name, target = target.name(), "nothing to flush");
            }
            Err(e) => {
                s.failures += 1;
                error!(
                    daemon = %daemon.name,
                    target = target.name(),
                    reason = ?reason,
                    error = %e,
                    "flush failed"
                );
            }
        }
    }
}
