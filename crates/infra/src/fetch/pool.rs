//! Bounded worker pool that drains a batch of work items.
//!
//! Each worker takes the next pending item, decides whether to attempt it
//! (artifact already stored? still backing off?), calls the fetcher, and
//! reports exactly one terminal outcome. Workers share nothing but the retry
//! cache and the work queue.
//!
//! A rate-limited fetch makes *that worker* pause before taking its next
//! item. Other workers keep going; this is not a pool-wide throttle.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::types::{
    ArtifactStore, FailureKind, FetchReport, FetchResult, Fetcher, ItemOutcome, ItemReport,
    WorkItem,
};
use crate::retry::RetryCache;

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Default courtesy pause after a rate-limited fetch.
pub const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(10);

/// Fetch pool configuration.
#[derive(Debug, Clone)]
pub struct FetchPoolConfig {
    /// Maximum concurrent workers
    pub workers: usize,
    /// How long a worker pauses after being rate limited
    pub rate_limit_pause: Duration,
    /// Treat `Unavailable` as permanent instead of consuming the backoff schedule
    pub unavailable_is_terminal: bool,
    /// Name for logging and worker threads
    pub name: String,
}

impl Default for FetchPoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            rate_limit_pause: DEFAULT_RATE_LIMIT_PAUSE,
            unavailable_is_terminal: false,
            name: "fetch-pool".to_string(),
        }
    }
}

impl FetchPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_rate_limit_pause(mut self, pause: Duration) -> Self {
        self.rate_limit_pause = pause;
        self
    }

    pub fn with_unavailable_terminal(mut self, terminal: bool) -> Self {
        self.unavailable_is_terminal = terminal;
        self
    }
}

/// Concurrent fetch pool.
pub struct FetchPool<F, A> {
    fetcher: F,
    artifacts: A,
    cache: Arc<RetryCache>,
    config: FetchPoolConfig,
}

impl<F, A> FetchPool<F, A>
where
    F: Fetcher,
    A: ArtifactStore<F::Payload>,
{
    pub fn new(fetcher: F, artifacts: A, cache: Arc<RetryCache>, config: FetchPoolConfig) -> Self {
        Self {
            fetcher,
            artifacts,
            cache,
            config,
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn artifacts(&self) -> &A {
        &self.artifacts
    }

    pub fn cache(&self) -> &Arc<RetryCache> {
        &self.cache
    }

    pub fn config(&self) -> &FetchPoolConfig {
        &self.config
    }

    /// Process every item and return once each has reported an outcome.
    ///
    /// Outcomes arrive in completion order, not submission order.
    pub fn run(&self, items: Vec<WorkItem>) -> FetchReport {
        let total = items.len();
        let workers = self.config.workers.max(1).min(total);
        let mut report = FetchReport::default();

        info!(pool = %self.config.name, items = total, workers, "fetch run started");
        if total == 0 {
            return report;
        }

        let started = Instant::now();
        let queue = Mutex::new(VecDeque::from(items));
        let (tx, rx) = mpsc::channel::<ItemReport>();

        thread::scope(|scope| {
            for n in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", self.config.name, n))
                    .spawn_scoped(scope, move || self.worker_loop(queue, tx));
                if let Err(e) = spawned {
                    error!(pool = %self.config.name, worker = n, error = %e, "failed to spawn worker");
                }
            }
            drop(tx);

            for item_report in rx {
                report.record(item_report);
            }
        });

        // Workers that failed to spawn leave items behind; drain them here so
        // every item still gets an outcome.
        let leftover: Vec<WorkItem> = queue
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into();
        for item in leftover {
            report.record(self.report(&item));
        }

        let summary = &report.counts;
        info!(
            pool = %self.config.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = summary.success,
            skipped_exists = summary.skipped_exists,
            skipped_backoff = summary.skipped_backoff,
            failed = summary.failed,
            failed_save = summary.failed_save,
            "fetch run finished"
        );
        info!(downloaded = ?report.downloaded_by_source(), "downloaded per source");
        info!(missing = ?report.missing_by_source(), "missing per source");

        report
    }

    fn worker_loop(&self, queue: &Mutex<VecDeque<WorkItem>>, tx: mpsc::Sender<ItemReport>) {
        loop {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(item) = next else {
                break;
            };

            let item_report = self.report(&item);
            let rate_limited = matches!(
                item_report.outcome,
                ItemOutcome::Failed {
                    reason: FailureKind::RateLimited,
                    ..
                }
            );

            if tx.send(item_report).is_err() {
                break;
            }

            if rate_limited && !self.config.rate_limit_pause.is_zero() {
                thread::sleep(self.config.rate_limit_pause);
            }
        }
    }

    fn report(&self, item: &WorkItem) -> ItemReport {
        ItemReport {
            item_id: item.item_id.clone(),
            label: item.label().to_string(),
            outcome: self.process(item),
        }
    }

    /// Run the per-item decision procedure.
    ///
    /// A panicking collaborator is contained to its own call: a fetcher panic
    /// counts as a fetch error, a panic while saving is a `FailedSave`, and a
    /// panic in the existence check is treated as "not stored yet".
    pub fn process(&self, item: &WorkItem) -> ItemOutcome {
        let id = &item.item_id;
        let label = item.label();

        let exists = contained(item, "artifact lookup", || self.artifacts.exists(item));
        if exists.unwrap_or(false) {
            debug!(item_id = %id, source = label, "already exists");
            return ItemOutcome::SkippedExists;
        }

        if !self.cache.should_retry(id) {
            info!(item_id = %id, source = label, "skipping; backing off after failed attempts");
            return ItemOutcome::SkippedBackoff;
        }

        let fetched = contained(item, "fetcher", || self.fetcher.fetch(item))
            .unwrap_or_else(|| FetchResult::Error("fetcher panicked".to_string()));

        let reason = match fetched {
            FetchResult::Content(payload) => {
                let saved = contained(item, "artifact store", || self.artifacts.save(item, payload));
                return match saved {
                    Some(Ok(())) => {
                        self.cache.record_success(id);
                        info!(item_id = %id, source = label, "downloaded");
                        ItemOutcome::Success
                    }
                    Some(Err(e)) => {
                        error!(item_id = %id, source = label, error = %e, "failed to save");
                        ItemOutcome::FailedSave {
                            error: e.to_string(),
                        }
                    }
                    None => ItemOutcome::FailedSave {
                        error: "artifact store panicked".to_string(),
                    },
                };
            }
            FetchResult::Unavailable => FailureKind::Unavailable,
            FetchResult::RateLimited => FailureKind::RateLimited,
            FetchResult::Error(detail) => FailureKind::Error(detail),
        };

        let attempts = if reason == FailureKind::Unavailable && self.config.unavailable_is_terminal
        {
            self.cache.record_permanent_failure(id)
        } else {
            self.cache.record_failure(id)
        };

        match &reason {
            FailureKind::Unavailable => {
                info!(item_id = %id, source = label, attempts, "not available")
            }
            FailureKind::RateLimited => {
                warn!(item_id = %id, source = label, attempts, "rate limited")
            }
            FailureKind::Error(detail) => {
                warn!(item_id = %id, source = label, attempts, error = %detail, "fetch failed")
            }
        }

        ItemOutcome::Failed { reason, attempts }
    }
}

/// Run one collaborator call, returning `None` if it panicked.
fn contained<T>(item: &WorkItem, what: &str, call: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(item_id = %item.item_id, collaborator = what, "collaborator panicked");
            None
        }
    }
}
