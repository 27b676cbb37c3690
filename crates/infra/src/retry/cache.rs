//! Thread-safe retry cache.
//!
//! Shared by every fetch worker. All reads and writes go through one mutex
//! covering the whole map; the lock is never held across I/O.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use tubesync_core::{Clock, ItemId, SyncResult};

use super::record::{RetryRecord, RetrySnapshot};
use super::schedule::BackoffSchedule;
use crate::daemon::{Flush, FlushReason};
use crate::storage::DurableStore;

#[derive(Debug, Default)]
struct CacheState {
    records: RetrySnapshot,
    /// Bumped on every mutation.
    generation: u64,
    /// Generation last written to durable storage.
    flushed: u64,
}

impl CacheState {
    fn touch(&mut self) {
        self.generation += 1;
    }
}

/// Per-item failure counts with time-based backoff.
pub struct RetryCache {
    state: Mutex<CacheState>,
    /// Serializes writers so an older snapshot never lands after a newer one.
    flush_lock: Mutex<()>,
    schedule: BackoffSchedule,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCache")
            .field("records", &self.len())
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl RetryCache {
    /// Create an empty cache.
    pub fn new(schedule: BackoffSchedule, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            flush_lock: Mutex::new(()),
            schedule,
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        // Every mutation is a single map operation, so a poisoned map is still
        // consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    /// Whether the item may be attempted now.
    pub fn should_retry(&self, item_id: &ItemId) -> bool {
        let now = self.clock.now();
        let state = self.state();

        let Some(record) = state.records.get(item_id) else {
            return true;
        };

        if self.schedule.is_exhausted(record.attempts) {
            return false;
        }

        let wait = TimeDelta::from_std(self.schedule.wait(record.attempts))
            .unwrap_or(TimeDelta::MAX);
        now - record.last_attempt >= wait
    }

    /// Count a failed attempt. Returns the attempt count after the update.
    pub fn record_failure(&self, item_id: &ItemId) -> u32 {
        let now = self.clock.now();
        let mut state = self.state();

        let attempts = match state.records.get_mut(item_id) {
            Some(record) => {
                record.bump(now);
                record.attempts
            }
            None => {
                state
                    .records
                    .insert(item_id.clone(), RetryRecord::first_failure(now));
                1
            }
        };
        state.touch();
        drop(state);

        debug!(item_id = %item_id, attempts, "recorded failed attempt");
        attempts
    }

    /// Mark an item as never to be retried, by saturating its attempt count.
    pub fn record_permanent_failure(&self, item_id: &ItemId) -> u32 {
        let now = self.clock.now();
        let max = self.schedule.max_attempts();
        let mut state = self.state();

        let record = state
            .records
            .entry(item_id.clone())
            .or_insert_with(|| RetryRecord::first_failure(now));
        record.attempts = record.attempts.max(max);
        record.last_attempt = now;
        let attempts = record.attempts;
        state.touch();
        drop(state);

        debug!(item_id = %item_id, attempts, "recorded permanent failure");
        attempts
    }

    /// Forget an item's failures. Returns whether a record was removed.
    pub fn record_success(&self, item_id: &ItemId) -> bool {
        let mut state = self.state();
        let removed = state.records.remove(item_id).is_some();
        if removed {
            state.touch();
        }
        removed
    }

    pub fn get(&self, item_id: &ItemId) -> Option<RetryRecord> {
        self.state().records.get(item_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> RetrySnapshot {
        self.state().records.clone()
    }

    /// Whether the map changed since the last successful flush.
    pub fn is_dirty(&self) -> bool {
        let state = self.state();
        state.generation != state.flushed
    }

    /// Replace the in-memory map with the stored snapshot.
    ///
    /// A missing or unreadable store yields an empty cache; this never fails.
    /// Returns the number of records loaded.
    pub fn load_from<S>(&self, store: &S) -> usize
    where
        S: DurableStore<RetrySnapshot> + ?Sized,
    {
        let records = match store.load() {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!(store = %store.location(), "no retry cache found; starting empty");
                RetrySnapshot::new()
            }
            Err(err) => {
                warn!(
                    store = %store.location(),
                    error = %err,
                    "retry cache unreadable; starting empty"
                );
                RetrySnapshot::new()
            }
        };

        let loaded = records.len();
        let mut state = self.state();
        state.records = records;
        state.touch();
        state.flushed = state.generation;
        drop(state);

        info!(store = %store.location(), records = loaded, "retry cache loaded");
        loaded
    }

    /// Write a consistent snapshot of the map to durable storage.
    ///
    /// Returns the number of records written.
    pub fn flush_to<S>(&self, store: &S) -> SyncResult<usize>
    where
        S: DurableStore<RetrySnapshot> + ?Sized,
    {
        let _writer = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, generation) = {
            let state = self.state();
            (state.records.clone(), state.generation)
        };

        store.save(&snapshot)?;

        let mut state = self.state();
        state.flushed = state.flushed.max(generation);
        drop(state);

        info!(store = %store.location(), records = snapshot.len(), "retry cache flushed");
        Ok(snapshot.len())
    }
}

/// A retry cache paired with the store it is flushed to.
pub struct PersistentRetryCache<S> {
    cache: Arc<RetryCache>,
    store: S,
}

impl<S> PersistentRetryCache<S>
where
    S: DurableStore<RetrySnapshot>,
{
    /// Load the cache from `store` and keep the pair for later flushes.
    pub fn open(cache: Arc<RetryCache>, store: S) -> Self {
        cache.load_from(&store);
        Self { cache, store }
    }

    pub fn cache(&self) -> &Arc<RetryCache> {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> Flush for PersistentRetryCache<S>
where
    S: DurableStore<RetrySnapshot>,
{
    fn name(&self) -> &str {
        "retry-cache"
    }

    fn flush(&self, reason: FlushReason) -> SyncResult<bool> {
        if reason == FlushReason::Periodic && !self.cache.is_dirty() {
            return Ok(false);
        }
        self.cache.flush_to(&self.store)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::storage::InMemoryStore;
    use tubesync_core::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn cache_with_clock() -> (RetryCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = RetryCache::new(BackoffSchedule::default(), clock.clone());
        (cache, clock)
    }

    fn id(raw: &str) -> ItemId {
        ItemId::new(raw).unwrap()
    }

    #[test]
    fn unknown_item_is_retryable() {
        let (cache, _) = cache_with_clock();
        assert!(cache.should_retry(&id("vid-1")));
    }

    #[test]
    fn first_failure_waits_for_second_schedule_slot() {
        let (cache, clock) = cache_with_clock();
        let item = id("vid-1");

        assert_eq!(cache.record_failure(&item), 1);

        clock.advance(Duration::seconds(30));
        assert!(!cache.should_retry(&item));

        clock.advance(Duration::seconds(31));
        assert!(cache.should_retry(&item));
    }

    #[test]
    fn exhausted_item_is_never_retried() {
        let (cache, clock) = cache_with_clock();
        let item = id("vid-1");

        for _ in 0..5 {
            cache.record_failure(&item);
        }
        assert_eq!(cache.get(&item).unwrap().attempts, 5);

        clock.advance(Duration::days(3_650));
        assert!(!cache.should_retry(&item));
    }

    #[test]
    fn success_removes_record_and_resets_count() {
        let (cache, _) = cache_with_clock();
        let item = id("vid-1");

        cache.record_failure(&item);
        cache.record_failure(&item);
        assert!(cache.record_success(&item));

        assert!(cache.get(&item).is_none());
        assert!(cache.should_retry(&item));
        assert_eq!(cache.record_failure(&item), 1);
    }

    #[test]
    fn success_on_unknown_item_is_noop() {
        let (cache, _) = cache_with_clock();
        assert!(!cache.record_success(&id("vid-1")));
        assert!(!cache.is_dirty());
    }

    #[test]
    fn permanent_failure_blocks_immediately() {
        let (cache, clock) = cache_with_clock();
        let item = id("vid-1");

        assert_eq!(cache.record_permanent_failure(&item), 5);
        clock.advance(Duration::days(30));
        assert!(!cache.should_retry(&item));
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(RetryCache::new(BackoffSchedule::default(), clock));
        let item = id("vid-1");

        std::thread::scope(|s| {
            for _ in 0..16 {
                let cache = cache.clone();
                let item = item.clone();
                s.spawn(move || {
                    cache.record_failure(&item);
                });
            }
        });

        assert_eq!(cache.get(&item).unwrap().attempts, 16);
    }

    #[test]
    fn flush_clears_dirty_flag() {
        let (cache, _) = cache_with_clock();
        let store: InMemoryStore<RetrySnapshot> = InMemoryStore::new();

        cache.record_failure(&id("vid-1"));
        assert!(cache.is_dirty());

        assert_eq!(cache.flush_to(&store).unwrap(), 1);
        assert!(!cache.is_dirty());
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn failed_flush_keeps_cache_dirty() {
        let (cache, _) = cache_with_clock();
        let store: InMemoryStore<RetrySnapshot> = InMemoryStore::new();
        store.set_fail_saves(true);

        cache.record_failure(&id("vid-1"));
        assert!(cache.flush_to(&store).is_err());
        assert!(cache.is_dirty());
    }

    #[test]
    fn load_replaces_existing_records() {
        let (cache, _) = cache_with_clock();
        cache.record_failure(&id("stale"));

        let mut stored = RetrySnapshot::new();
        stored.insert(id("vid-9"), RetryRecord::first_failure(start()));
        let store = InMemoryStore::with_snapshot(stored);

        assert_eq!(cache.load_from(&store), 1);
        assert!(cache.get(&id("stale")).is_none());
        assert_eq!(cache.get(&id("vid-9")).unwrap().attempts, 1);
        assert!(!cache.is_dirty());
    }

    #[test]
    fn periodic_flush_skips_clean_cache() {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(RetryCache::new(BackoffSchedule::default(), clock));
        let store = InMemoryStore::<RetrySnapshot>::arc();
        let persistent = PersistentRetryCache::open(cache.clone(), store.clone());

        assert!(!persistent.flush(FlushReason::Periodic).unwrap());
        cache.record_failure(&id("vid-1"));
        assert!(persistent.flush(FlushReason::Periodic).unwrap());
        assert!(persistent.flush(FlushReason::Final).unwrap());
        assert_eq!(store.save_count(), 2);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Property: N failures without an intervening success always
            /// yield exactly N attempts.
            #[test]
            fn failures_count_exactly(n in 1u32..50) {
                let (cache, clock) = cache_with_clock();
                let item = id("vid-1");
                for _ in 0..n {
                    clock.advance(Duration::seconds(1));
                    cache.record_failure(&item);
                }
                prop_assert_eq!(cache.get(&item).unwrap().attempts, n);
                if n >= 5 {
                    prop_assert!(!cache.should_retry(&item));
                }
            }
        }
    }
}
