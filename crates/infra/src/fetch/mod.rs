//! Concurrent fetching gated by the retry cache.
//!
//! - `types`: work items, collaborator traits ([`Fetcher`], [`ArtifactStore`]) and outcomes
//! - `pool`: the bounded worker pool ([`FetchPool`])

pub mod pool;
pub mod types;

pub use pool::{DEFAULT_RATE_LIMIT_PAUSE, DEFAULT_WORKERS, FetchPool, FetchPoolConfig};
pub use types::{
    ArtifactStore, FailureKind, FetchReport, FetchResult, Fetcher, ItemOutcome, ItemReport,
    OutcomeCounts, SOURCE_NAME_KEY, SourceTally, WorkItem,
};
