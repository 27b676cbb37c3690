//! Sync infrastructure: retry cache, source cursors, durable storage, the
//! concurrent fetch pool, the background persistence daemon and the runtime
//! that wires them together.

pub mod config;
pub mod cursor;
pub mod daemon;
pub mod fetch;
pub mod retry;
pub mod runtime;
pub mod sources;
pub mod storage;

mod integration_tests;

pub use config::SyncConfig;
pub use cursor::{CursorSnapshot, CursorStore, CursorUpdate};
pub use daemon::{DaemonHandle, DaemonStats, Flush, FlushReason, PersistenceDaemon};
pub use fetch::{FetchPool, FetchPoolConfig, FetchReport, FetchResult, ItemOutcome, WorkItem};
pub use retry::{BackoffSchedule, PersistentRetryCache, RetryCache, RetryRecord};
pub use runtime::SyncRuntime;
pub use storage::{DurableStore, InMemoryStore, JsonFileStore};
