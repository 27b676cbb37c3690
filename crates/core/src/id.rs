//! Strongly-typed identifiers used across the sync subsystem.
//!
//! Platform identifiers are opaque strings (video ids, channel ids, playlist
//! ids). They are wrapped so a video id can never be passed where a channel id
//! is expected.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Identifier of a single fetchable item (e.g. one video).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

/// Identifier of a source that items are listed from (a channel or a playlist).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a raw identifier.
            ///
            /// Surrounding whitespace is trimmed; an empty identifier is rejected.
            pub fn new(raw: impl Into<String>) -> Result<Self, SyncError> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(SyncError::validation(concat!($name, " must not be empty")));
                }
                if trimmed.len() == raw.len() {
                    Ok(Self(raw))
                } else {
                    Ok(Self(trimmed.to_string()))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(ItemId, "ItemId");
impl_string_newtype!(SourceId, "SourceId");

/// Kind of source a cursor tracks.
///
/// The serialized names match the section keys of the cursor file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "channels")]
    Channel,
    #[serde(rename = "playlists")]
    Playlist,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Channel => "channels",
            SourceKind::Playlist => "playlists",
        }
    }
}

impl core::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "channel" | "channels" => Ok(SourceKind::Channel),
            "playlist" | "playlists" => Ok(SourceKind::Playlist),
            other => Err(SyncError::validation(format!("unknown source kind: {other}"))),
        }
    }
}
