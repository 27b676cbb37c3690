//! Source cursor (watermark) persistence.
//!
//! A cursor records the newest publish time already synchronized for a
//! (source kind, source id) pair. Listing code uses it to avoid requesting
//! items that a previous run already picked up:
//! - items published at or before the watermark are skipped
//! - after a batch is stored, the watermark advances to the batch's newest item
//!
//! Unlike the retry cache, every update is persisted before it returns.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tubesync_core::{SourceId, SourceKind, SyncResult};

use crate::daemon::{Flush, FlushReason};
use crate::storage::DurableStore;

/// Durable layout of all cursors, one section per source kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    #[serde(default)]
    pub channels: BTreeMap<SourceId, DateTime<Utc>>,
    #[serde(default)]
    pub playlists: BTreeMap<SourceId, DateTime<Utc>>,
}

impl CursorSnapshot {
    fn section(&self, kind: SourceKind) -> &BTreeMap<SourceId, DateTime<Utc>> {
        match kind {
            SourceKind::Channel => &self.channels,
            SourceKind::Playlist => &self.playlists,
        }
    }

    fn section_mut(&mut self, kind: SourceKind) -> &mut BTreeMap<SourceId, DateTime<Utc>> {
        match kind {
            SourceKind::Channel => &mut self.channels,
            SourceKind::Playlist => &mut self.playlists,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len() + self.playlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a cursor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    /// The watermark moved forward (or was set for the first time) and was persisted.
    Advanced {
        previous: Option<DateTime<Utc>>,
    },
    /// The candidate equals the stored watermark; nothing was written.
    Unchanged,
    /// The candidate is older than the stored watermark and was ignored.
    Stale { current: DateTime<Utc> },
}

/// Thread-safe cursor map mirrored to a durable store.
pub struct CursorStore<S> {
    state: Mutex<CursorSnapshot>,
    store: S,
}

impl<S> std::fmt::Debug for CursorStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore")
            .field("cursors", &self.state().len())
            .finish()
    }
}

impl<S> CursorStore<S> {
    fn state(&self) -> MutexGuard<'_, CursorSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored watermark for a source, if any.
    pub fn get(&self, kind: SourceKind, source_id: &SourceId) -> Option<DateTime<Utc>> {
        self.state().section(kind).get(source_id).copied()
    }

    /// Whether an item published at `published_at` is newer than the watermark.
    pub fn is_new(
        &self,
        kind: SourceKind,
        source_id: &SourceId,
        published_at: DateTime<Utc>,
    ) -> bool {
        match self.get(kind, source_id) {
            Some(watermark) => published_at > watermark,
            None => true,
        }
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        self.state().clone()
    }
}

impl<S> CursorStore<S>
where
    S: DurableStore<CursorSnapshot>,
{
    /// Load cursors from `store`.
    ///
    /// A missing or unreadable store yields an empty cursor set; this never fails.
    pub fn open(store: S) -> Self {
        let snapshot = match store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(store = %store.location(), "no cursor file found; starting empty");
                CursorSnapshot::default()
            }
            Err(err) => {
                warn!(
                    store = %store.location(),
                    error = %err,
                    "cursor file unreadable; starting empty"
                );
                CursorSnapshot::default()
            }
        };

        info!(store = %store.location(), cursors = snapshot.len(), "cursors loaded");
        Self {
            state: Mutex::new(snapshot),
            store,
        }
    }

    /// Move a source's watermark to `candidate` and persist it.
    ///
    /// Watermarks never regress: an older candidate is reported as
    /// [`CursorUpdate::Stale`] and ignored. If persisting fails the in-memory
    /// value is restored and the error is returned.
    pub fn update(
        &self,
        kind: SourceKind,
        source_id: &SourceId,
        candidate: DateTime<Utc>,
    ) -> SyncResult<CursorUpdate> {
        // Held across the write so concurrent updates reach disk in order.
        let mut state = self.state();
        let previous = state.section(kind).get(source_id).copied();

        match previous {
            Some(current) if candidate < current => {
                warn!(
                    kind = %kind,
                    source = %source_id,
                    %current,
                    %candidate,
                    "ignoring cursor update older than stored watermark"
                );
                return Ok(CursorUpdate::Stale { current });
            }
            Some(current) if candidate == current => return Ok(CursorUpdate::Unchanged),
            _ => {}
        }

        state.section_mut(kind).insert(source_id.clone(), candidate);
        if let Err(err) = self.store.save(&*state) {
            match previous {
                Some(prev) => state.section_mut(kind).insert(source_id.clone(), prev),
                None => state.section_mut(kind).remove(source_id),
            };
            return Err(err);
        }

        info!(kind = %kind, source = %source_id, watermark = %candidate, "cursor updated");
        Ok(CursorUpdate::Advanced { previous })
    }

    /// Advance the watermark to the newest of `published`.
    ///
    /// Returns `None` for an empty batch.
    pub fn advance_to_newest<I>(
        &self,
        kind: SourceKind,
        source_id: &SourceId,
        published: I,
    ) -> SyncResult<Option<CursorUpdate>>
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        match published.into_iter().max() {
            Some(newest) => self.update(kind, source_id, newest).map(Some),
            None => Ok(None),
        }
    }

    /// Forget a source's watermark so the next run lists it from scratch.
    pub fn clear(&self, kind: SourceKind, source_id: &SourceId) -> SyncResult<bool> {
        let mut state = self.state();
        let Some(previous) = state.section_mut(kind).remove(source_id) else {
            return Ok(false);
        };

        if let Err(err) = self.store.save(&*state) {
            state.section_mut(kind).insert(source_id.clone(), previous);
            return Err(err);
        }

        info!(kind = %kind, source = %source_id, "cursor cleared");
        Ok(true)
    }
}

impl<S> Flush for CursorStore<S>
where
    S: DurableStore<CursorSnapshot>,
{
    fn name(&self) -> &str {
        "cursor-store"
    }

    fn flush(&self, reason: FlushReason) -> SyncResult<bool> {
        // Updates are already durable; only rewrite on shutdown.
        if reason == FlushReason::Periodic {
            return Ok(false);
        }
        let state = self.state();
        self.store.save(&*state)?;
        Ok(true)
    }
}
