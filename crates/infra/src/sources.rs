//! Source list files: one channel or playlist id per line.
//!
//! Blank lines and lines starting with `#` are ignored, and anything after a
//! `#` on a line is treated as a comment.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use tubesync_core::{SourceId, SyncError, SyncResult};

pub fn parse_source_list(text: &str) -> Vec<SourceId> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let id = line.split('#').next().unwrap_or_default().trim();
            SourceId::new(id).ok()
        })
        .collect()
}

/// Read a source list from disk. A missing file yields an empty list.
pub fn load_source_list(path: impl AsRef<Path>) -> SyncResult<Vec<SourceId>> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "source list does not exist; skipping");
            return Ok(Vec::new());
        }
        Err(e) => return Err(SyncError::io(path, e)),
    };

    let ids = parse_source_list(&text);
    debug!(path = %path.display(), count = ids.len(), "source list loaded");
    Ok(ids)
}
