//! Persistent retry bookkeeping for items that failed to fetch.
//!
//! ## Components
//!
//! - `BackoffSchedule`: minimum wait per attempt count, plus the attempt ceiling
//! - `RetryRecord`: failure count and last attempt time of one item
//! - `RetryCache`: thread-safe map consulted by every fetch worker
//! - `PersistentRetryCache`: a cache bound to its durable store, flushed by the daemon

pub mod cache;
pub mod record;
pub mod schedule;

pub use cache::{PersistentRetryCache, RetryCache};
pub use record::{LAST_ATTEMPT_FORMAT, RetryRecord, RetrySnapshot};
pub use schedule::{BackoffSchedule, DEFAULT_MAX_ATTEMPTS, DEFAULT_WAITS_SECS};
