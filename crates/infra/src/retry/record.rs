//! Persisted retry state for one item.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tubesync_core::ItemId;

/// On-disk layout of `last_attempt`.
///
/// The timestamp carries no zone and is read back as UTC. Files written by
/// the older ingestion scripts used local time, so their records are offset
/// by the writer's UTC offset: east of UTC they appear to be in the future
/// and back off for longer than scheduled, west of UTC for less.
pub const LAST_ATTEMPT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Failure history of a single item.
///
/// The owning item id is the key of the surrounding map. A record only exists
/// while the item has unresolved failures; success deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempts: u32,
    #[serde(with = "last_attempt_format")]
    pub last_attempt: DateTime<Utc>,
}

impl RetryRecord {
    /// Record of a first failure at `at`.
    pub fn first_failure(at: DateTime<Utc>) -> Self {
        Self {
            attempts: 1,
            last_attempt: at,
        }
    }

    /// Count one more failure at `at`.
    pub fn bump(&mut self, at: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = at;
    }
}

/// Snapshot of the whole retry cache, as stored on disk.
///
/// Ordered so successive flushes of the same state produce identical files.
pub type RetrySnapshot = BTreeMap<ItemId, RetryRecord>;

/// Second-precision, zone-less timestamps (always written in UTC).
mod last_attempt_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::LAST_ATTEMPT_FORMAT;

    pub fn serialize<S>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&at.format(LAST_ATTEMPT_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, LAST_ATTEMPT_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn record_uses_flat_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        let record = RetryRecord::first_failure(at);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "attempts": 1, "last_attempt": "2024-05-01 12:30:05" })
        );

        let back: RetryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let json = serde_json::json!({ "attempts": 2, "last_attempt": "yesterday" });
        assert!(serde_json::from_value::<RetryRecord>(json).is_err());
    }

    #[test]
    fn bump_increments_and_moves_timestamp() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

        let mut record = RetryRecord::first_failure(first);
        record.bump(later);

        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_attempt, later);
    }
}
