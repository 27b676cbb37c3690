//! Work items, collaborator contracts, and per-item outcomes.

use std::collections::BTreeMap;

use serde::Serialize;

use tubesync_core::{ItemId, SourceId, SyncResult};

/// Context key whose value labels an item's source in reports.
pub const SOURCE_NAME_KEY: &str = "source_name";

/// One unit of work submitted to the fetch pool (e.g. one video).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub item_id: ItemId,
    pub source_id: SourceId,
    /// Free-form metadata used for logging and reporting only.
    pub context: BTreeMap<String, String>,
}

impl WorkItem {
    pub fn new(item_id: ItemId, source_id: SourceId) -> Self {
        Self {
            item_id,
            source_id,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Label this item is tallied under: the source name when known, else the
    /// source id.
    pub fn label(&self) -> &str {
        self.context
            .get(SOURCE_NAME_KEY)
            .map(String::as_str)
            .unwrap_or_else(|| self.source_id.as_str())
    }
}

/// Result of one remote fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult<P> {
    /// The artifact was retrieved.
    Content(P),
    /// The platform reports the artifact does not exist for this item.
    Unavailable,
    /// The platform is throttling requests.
    RateLimited,
    /// Any other failure.
    Error(String),
}

/// Retrieves an item's artifact from the remote platform.
pub trait Fetcher: Send + Sync {
    type Payload;

    fn fetch(&self, item: &WorkItem) -> FetchResult<Self::Payload>;
}

/// Local storage for fetched artifacts.
pub trait ArtifactStore<P>: Send + Sync {
    /// Whether the artifact was already stored by an earlier run.
    fn exists(&self, item: &WorkItem) -> bool;

    /// Store a fetched artifact.
    fn save(&self, item: &WorkItem, payload: P) -> SyncResult<()>;
}

/// Why an attempted fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unavailable,
    RateLimited,
    Error(String),
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ItemOutcome {
    /// Artifact already stored; the retry cache was not consulted.
    SkippedExists,
    /// Retry cache says the item is still backing off (or exhausted).
    SkippedBackoff,
    /// Fetched and stored; any retry record was cleared.
    Success,
    /// Fetch failed and was recorded in the retry cache.
    Failed { reason: FailureKind, attempts: u32 },
    /// Fetched but storing failed; the retry cache was left untouched.
    FailedSave { error: String },
}

impl ItemOutcome {
    /// Whether the artifact is available locally after this outcome.
    pub fn is_downloaded(&self) -> bool {
        matches!(self, ItemOutcome::Success | ItemOutcome::SkippedExists)
    }

    /// Whether a remote fetch was made.
    pub fn attempted(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Success | ItemOutcome::Failed { .. } | ItemOutcome::FailedSave { .. }
        )
    }
}

/// Outcome of one item, as reported back from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub item_id: ItemId,
    pub label: String,
    pub outcome: ItemOutcome,
}

/// Per-source tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceTally {
    pub downloaded: usize,
    pub missing: usize,
}

/// Counts per outcome kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub skipped_exists: usize,
    pub skipped_backoff: usize,
    pub success: usize,
    pub failed: usize,
    pub failed_save: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.skipped_exists + self.skipped_backoff + self.success + self.failed + self.failed_save
    }
}

/// Aggregated result of a pool run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub items: Vec<ItemReport>,
    pub per_source: BTreeMap<String, SourceTally>,
    pub counts: OutcomeCounts,
}

impl FetchReport {
    pub fn record(&mut self, report: ItemReport) {
        let tally = self.per_source.entry(report.label.clone()).or_default();
        if report.outcome.is_downloaded() {
            tally.downloaded += 1;
        } else {
            tally.missing += 1;
        }

        match &report.outcome {
            ItemOutcome::SkippedExists => self.counts.skipped_exists += 1,
            ItemOutcome::SkippedBackoff => self.counts.skipped_backoff += 1,
            ItemOutcome::Success => self.counts.success += 1,
            ItemOutcome::Failed { .. } => self.counts.failed += 1,
            ItemOutcome::FailedSave { .. } => self.counts.failed_save += 1,
        }

        self.items.push(report);
    }

    pub fn outcome_of(&self, item_id: &ItemId) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|r| &r.item_id == item_id)
            .map(|r| &r.outcome)
    }

    pub fn tally(&self, label: &str) -> SourceTally {
        self.per_source.get(label).copied().unwrap_or_default()
    }

    /// Downloaded counts per source, for the end-of-run summary.
    pub fn downloaded_by_source(&self) -> BTreeMap<&str, usize> {
        self.per_source
            .iter()
            .filter(|(_, t)| t.downloaded > 0)
            .map(|(label, t)| (label.as_str(), t.downloaded))
            .collect()
    }

    /// Missing counts per source, for the end-of-run summary.
    pub fn missing_by_source(&self) -> BTreeMap<&str, usize> {
        self.per_source
            .iter()
            .filter(|(_, t)| t.missing > 0)
            .map(|(label, t)| (label.as_str(), t.missing))
            .collect()
    }
}
