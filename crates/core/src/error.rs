//! Sync subsystem error model.

use std::path::PathBuf;

use thiserror::Error;

/// Result type used across the sync subsystem.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync-level error.
///
/// Remote fetch outcomes are *not* errors; they are modelled as values by the
/// fetch layer. This type covers configuration, validation and durable storage.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A value failed validation (e.g. malformed input or configuration).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reading or writing a durable file failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A durable file could not be encoded or decoded.
    #[error("malformed data in {path}: {message}")]
    Serialization { path: PathBuf, message: String },
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serialization(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Serialization {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
