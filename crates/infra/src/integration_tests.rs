//! End-to-end tests over real files.
//!
//! Covers:
//! - cursors and retry records surviving a restart through `JsonFileStore`
//! - a malformed retry file starting an empty cache
//! - a mixed batch drained by the fetch pool
//! - the daemon flushing the retry cache to disk

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tubesync_core::{ItemId, ManualClock, SourceId, SourceKind, SyncResult};

    use crate::cursor::{CursorSnapshot, CursorStore, CursorUpdate};
    use crate::daemon::PersistenceDaemon;
    use crate::fetch::{
        ArtifactStore, FailureKind, FetchPool, FetchPoolConfig, FetchResult, Fetcher, ItemOutcome,
        SOURCE_NAME_KEY, WorkItem,
    };
    use crate::retry::{BackoffSchedule, PersistentRetryCache, RetryCache, RetrySnapshot};
    use crate::storage::JsonFileStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn new_cache() -> Arc<RetryCache> {
        Arc::new(RetryCache::new(
            BackoffSchedule::default(),
            Arc::new(ManualClock::new(start())),
        ))
    }

    fn item_id(raw: &str) -> ItemId {
        ItemId::new(raw).unwrap()
    }

    fn retry_store(path: &Path) -> JsonFileStore<RetrySnapshot> {
        JsonFileStore::new(path)
    }

    #[test]
    fn cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join("cache.json");
        let channel = SourceId::new("UCxyz").unwrap();
        let watermark: DateTime<Utc> = "2024-05-01T00:00:00Z".parse().unwrap();

        {
            let cursors = CursorStore::open(JsonFileStore::<CursorSnapshot>::new(&path));
            assert_eq!(
                cursors.update(SourceKind::Channel, &channel, watermark).unwrap(),
                CursorUpdate::Advanced { previous: None }
            );
        }

        let reopened = CursorStore::open(JsonFileStore::<CursorSnapshot>::new(&path));
        assert_eq!(reopened.get(SourceKind::Channel, &channel), Some(watermark));
        assert_eq!(reopened.get(SourceKind::Playlist, &channel), None);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["channels"]["UCxyz"].is_string());
        assert!(raw["playlists"].as_object().unwrap().is_empty());
    }

    #[test]
    fn retry_records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_transcripts.json");

        let cache = new_cache();
        cache.record_failure(&item_id("v1"));
        cache.record_failure(&item_id("v1"));
        cache.record_failure(&item_id("v2"));
        assert_eq!(cache.flush_to(&retry_store(&path)).unwrap(), 2);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"last_attempt\": \"2024-05-01 12:00:00\""));

        let restarted = new_cache();
        assert_eq!(restarted.load_from(&retry_store(&path)), 2);
        assert_eq!(restarted.get(&item_id("v1")).unwrap().attempts, 2);
        assert_eq!(restarted.get(&item_id("v2")).unwrap().attempts, 1);
    }

    #[test]
    fn malformed_retry_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_transcripts.json");
        fs::write(&path, "{ not json").unwrap();

        let persistent = PersistentRetryCache::open(new_cache(), retry_store(&path));
        assert!(persistent.cache().is_empty());
        assert!(persistent.cache().should_retry(&item_id("anything")));
    }

    #[test]
    fn missing_retry_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache();
        assert_eq!(cache.load_from(&retry_store(&dir.path().join("absent.json"))), 0);
        assert!(cache.is_empty());
    }

    struct BatchFetcher {
        rate_limited: HashSet<String>,
        calls: AtomicUsize,
    }

    impl Fetcher for BatchFetcher {
        type Payload = String;

        fn fetch(&self, item: &WorkItem) -> FetchResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limited.contains(item.item_id.as_str()) {
                FetchResult::RateLimited
            } else {
                FetchResult::Content(format!("transcript of {}", item.item_id))
            }
        }
    }

    struct DirArtifacts {
        existing: HashSet<String>,
        saved: Mutex<Vec<String>>,
    }

    impl ArtifactStore<String> for DirArtifacts {
        fn exists(&self, item: &WorkItem) -> bool {
            self.existing.contains(item.item_id.as_str())
        }

        fn save(&self, item: &WorkItem, _payload: String) -> SyncResult<()> {
            self.saved.lock().unwrap().push(item.item_id.to_string());
            Ok(())
        }
    }

    #[test]
    fn mixed_batch_reports_every_item_once() {
        let ids: Vec<String> = (0..10).map(|n| format!("v{n}")).collect();
        let items: Vec<WorkItem> = ids
            .iter()
            .map(|id| {
                WorkItem::new(item_id(id), SourceId::new("UCxyz").unwrap())
                    .with_context(SOURCE_NAME_KEY, "Example Channel")
            })
            .collect();

        let fetcher = BatchFetcher {
            rate_limited: ids[2..5].iter().cloned().collect(),
            calls: AtomicUsize::new(0),
        };
        let artifacts = DirArtifacts {
            existing: ids[0..2].iter().cloned().collect(),
            saved: Mutex::new(Vec::new()),
        };
        let cache = new_cache();
        let config = FetchPoolConfig::default()
            .with_workers(3)
            .with_rate_limit_pause(Duration::ZERO);
        let pool = FetchPool::new(fetcher, artifacts, cache.clone(), config);

        let report = pool.run(items);

        assert_eq!(report.items.len(), 10);
        assert_eq!(report.counts.skipped_exists, 2);
        assert_eq!(report.counts.failed, 3);
        assert_eq!(report.counts.success, 5);
        assert_eq!(report.counts.skipped_backoff, 0);

        let tally = report.tally("Example Channel");
        assert_eq!(tally.downloaded, 7);
        assert_eq!(tally.missing, 3);

        // Existing artifacts never reach the fetcher.
        assert_eq!(pool.fetcher().calls.load(Ordering::SeqCst), 8);

        for id in &ids[2..5] {
            assert_eq!(cache.get(&item_id(id)).unwrap().attempts, 1);
            assert_eq!(
                report.outcome_of(&item_id(id)),
                Some(&ItemOutcome::Failed {
                    reason: FailureKind::RateLimited,
                    attempts: 1
                })
            );
        }
        for id in ids[0..2].iter().chain(&ids[5..]) {
            assert!(cache.get(&item_id(id)).is_none());
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn daemon_writes_retry_cache_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join("failed_transcripts.json");

        let persistent = Arc::new(PersistentRetryCache::open(new_cache(), retry_store(&path)));
        let handle = PersistenceDaemon::new(Duration::from_secs(3_600))
            .unwrap()
            .with_target(persistent.clone())
            .start()
            .unwrap();

        persistent.cache().record_failure(&item_id("v9"));
        let stats = handle.stop();
        assert_eq!(stats.writes, 1);

        let restarted = new_cache();
        assert_eq!(restarted.load_from(&retry_store(&path)), 1);
        assert_eq!(restarted.get(&item_id("v9")).unwrap().attempts, 1);
        assert!(!persistent.cache().is_dirty());
    }
}
