//! Process wiring for one sync run.
//!
//! Opens the retry cache and cursors from the configured files, starts the
//! persistence daemon over both, and hands out fetch pools bound to the
//! shared cache. Shutting down (or dropping) the runtime performs the final
//! flush.

use std::sync::Arc;

use tracing::info;

use tubesync_core::{Clock, SyncResult};

use crate::config::SyncConfig;
use crate::cursor::{CursorSnapshot, CursorStore};
use crate::daemon::{DaemonHandle, DaemonStats, PersistenceDaemon};
use crate::fetch::{ArtifactStore, FetchPool, FetchPoolConfig, FetchReport, Fetcher, WorkItem};
use crate::retry::{PersistentRetryCache, RetryCache, RetrySnapshot};
use crate::storage::JsonFileStore;

pub type FileRetryCache = PersistentRetryCache<JsonFileStore<RetrySnapshot>>;
pub type FileCursorStore = CursorStore<JsonFileStore<CursorSnapshot>>;

/// Loaded state plus the running daemon that persists it.
pub struct SyncRuntime {
    retry: Arc<FileRetryCache>,
    cursors: Arc<FileCursorStore>,
    pool_config: FetchPoolConfig,
    daemon: DaemonHandle,
}

impl SyncRuntime {
    /// Load durable state and start the persistence daemon.
    ///
    /// Missing or malformed files start empty; only an invalid configuration
    /// or a failure to spawn the daemon is an error.
    pub fn open(config: &SyncConfig, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        config.validate()?;

        let cache = Arc::new(RetryCache::new(config.backoff_schedule()?, clock));
        let retry: Arc<FileRetryCache> = Arc::new(PersistentRetryCache::open(
            cache,
            JsonFileStore::new(&config.retry_cache_path),
        ));
        let cursors: Arc<FileCursorStore> =
            Arc::new(CursorStore::open(JsonFileStore::new(&config.cursor_path)));

        let daemon = PersistenceDaemon::new(config.flush_interval())?
            .with_target(retry.clone())
            .with_target(cursors.clone())
            .start()?;

        info!(
            retry_cache = %config.retry_cache_path.display(),
            cursors = %config.cursor_path.display(),
            "sync runtime opened"
        );

        Ok(Self {
            retry,
            cursors,
            pool_config: config.pool_config(),
            daemon,
        })
    }

    pub fn cache(&self) -> &Arc<RetryCache> {
        self.retry.cache()
    }

    pub fn cursors(&self) -> &Arc<FileCursorStore> {
        &self.cursors
    }

    pub fn pool_config(&self) -> &FetchPoolConfig {
        &self.pool_config
    }

    /// Build a pool over the shared cache with the configured settings.
    pub fn pool<F, A>(&self, fetcher: F, artifacts: A) -> FetchPool<F, A>
    where
        F: Fetcher,
        A: ArtifactStore<F::Payload>,
    {
        FetchPool::new(
            fetcher,
            artifacts,
            self.cache().clone(),
            self.pool_config.clone(),
        )
    }

    /// Fetch one batch with a fresh pool.
    pub fn run<F, A>(&self, fetcher: F, artifacts: A, items: Vec<WorkItem>) -> FetchReport
    where
        F: Fetcher,
        A: ArtifactStore<F::Payload>,
    {
        self.pool(fetcher, artifacts).run(items)
    }

    /// Stop the daemon after its final flush.
    pub fn shutdown(self) -> DaemonStats {
        let stats = self.daemon.stop();
        info!(writes = stats.writes, failures = stats.failures, "sync runtime closed");
        stats
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::fetch::{FetchResult, ItemOutcome};
    use tubesync_core::{ItemId, ManualClock, SourceId, SourceKind, SyncError};

    struct AlwaysLimited;

    impl Fetcher for AlwaysLimited {
        type Payload = String;

        fn fetch(&self, _item: &WorkItem) -> FetchResult<String> {
            FetchResult::RateLimited
        }
    }

    struct NothingStored;

    impl ArtifactStore<String> for NothingStored {
        fn exists(&self, _item: &WorkItem) -> bool {
            false
        }

        fn save(&self, _item: &WorkItem, _payload: String) -> SyncResult<()> {
            Ok(())
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn config_in(dir: &std::path::Path) -> SyncConfig {
        SyncConfig {
            retry_cache_path: dir.join("output").join("failed_transcripts.json"),
            cursor_path: dir.join("output").join("cache.json"),
            rate_limit_pause_secs: 0,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn state_survives_shutdown_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let channel = SourceId::new("UCxyz").unwrap();
        let watermark: DateTime<Utc> = "2024-05-01T00:00:00Z".parse().unwrap();

        let runtime = SyncRuntime::open(&config, clock()).unwrap();
        assert!(runtime.cache().is_empty());
        assert_eq!(runtime.pool_config().workers, 5);

        let items = vec![WorkItem::new(ItemId::new("v1").unwrap(), channel.clone())];
        let report = runtime.run(AlwaysLimited, NothingStored, items);
        assert!(matches!(
            report.outcome_of(&ItemId::new("v1").unwrap()),
            Some(ItemOutcome::Failed { attempts: 1, .. })
        ));
        runtime
            .cursors()
            .update(SourceKind::Channel, &channel, watermark)
            .unwrap();

        let stats = runtime.shutdown();
        assert_eq!(stats.failures, 0);
        assert!(config.retry_cache_path.exists());

        let reopened = SyncRuntime::open(&config, clock()).unwrap();
        assert_eq!(
            reopened.cache().get(&ItemId::new("v1").unwrap()).unwrap().attempts,
            1
        );
        assert_eq!(
            reopened.cursors().get(SourceKind::Channel, &channel),
            Some(watermark)
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            max_workers: 0,
            ..config_in(dir.path())
        };
        assert!(matches!(
            SyncRuntime::open(&config, clock()),
            Err(SyncError::Validation(_))
        ));
    }
}
