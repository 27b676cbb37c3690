//! Backoff schedule for failed items.

use std::time::Duration;

use tubesync_core::{SyncError, SyncResult};

/// Default attempt ceiling after which an item is never retried again.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default minimum waits, in seconds, indexed by attempt count.
pub const DEFAULT_WAITS_SECS: [u64; 5] = [0, 60, 3_600, 86_400, 86_400];

/// Minimum wait durations between attempts, indexed by how many attempts
/// have already failed.
///
/// The last entry repeats for any attempt count past the end of the list.
/// The attempt ceiling is independent of the schedule length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    waits: Vec<Duration>,
    max_attempts: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            waits: DEFAULT_WAITS_SECS
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffSchedule {
    /// Create a schedule. At least one wait and one attempt are required.
    pub fn new(waits: Vec<Duration>, max_attempts: u32) -> SyncResult<Self> {
        if waits.is_empty() {
            return Err(SyncError::validation("backoff schedule must not be empty"));
        }
        if max_attempts == 0 {
            return Err(SyncError::validation("max_attempts must be at least 1"));
        }
        Ok(Self {
            waits,
            max_attempts,
        })
    }

    /// Create a schedule from whole seconds.
    pub fn from_secs(waits: &[u64], max_attempts: u32) -> SyncResult<Self> {
        Self::new(
            waits.iter().copied().map(Duration::from_secs).collect(),
            max_attempts,
        )
    }

    /// Minimum time that must pass after the last attempt before the next one.
    pub fn wait(&self, attempts: u32) -> Duration {
        let idx = (attempts as usize).min(self.waits.len() - 1);
        self.waits[idx]
    }

    /// Whether an item with this many failed attempts is permanently ineligible.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }
}
