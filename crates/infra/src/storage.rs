//! Durable snapshot storage.
//!
//! The retry cache and the cursor store both mirror an in-memory map into a
//! single JSON document. A [`DurableStore`] loads and replaces that document
//! as a whole; it never patches it in place.

use std::fs::File;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::ser::PrettyFormatter;
use uuid::Uuid;

use tubesync_core::{SyncError, SyncResult};

/// Whole-document persistence for a snapshot of type `T`.
pub trait DurableStore<T>: Send + Sync {
    /// Load the stored snapshot.
    ///
    /// `Ok(None)` means nothing has been stored yet. A document that exists but
    /// cannot be decoded is an error; callers decide whether that is fatal.
    fn load(&self) -> SyncResult<Option<T>>;

    /// Replace the stored snapshot.
    fn save(&self, value: &T) -> SyncResult<()>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

impl<T, S> DurableStore<T> for Arc<S>
where
    S: DurableStore<T> + ?Sized,
{
    fn load(&self) -> SyncResult<Option<T>> {
        (**self).load()
    }

    fn save(&self, value: &T) -> SyncResult<()> {
        (**self).save(value)
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// JSON file store.
///
/// Writes go to a temporary sibling file which is then renamed over the
/// target, so a crash mid-write leaves either the old or the new document and
/// never a truncated one.
#[derive(Debug)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    _snapshot: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _snapshot: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()))
    }
}

impl<T> Clone for JsonFileStore<T> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<T> DurableStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> SyncResult<Option<T>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(&self.path, e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::serialization(&self.path, e))
    }

    fn save(&self, value: &T) -> SyncResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }

        let bytes = to_pretty_json(value).map_err(|e| SyncError::serialization(&self.path, e))?;

        let tmp = self.temp_path();
        let written = write_synced(&tmp, &bytes).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(SyncError::io(&self.path, e));
        }

        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Pretty-print with a four space indent, matching files written by earlier
/// tooling so diffs between runs stay readable.
fn to_pretty_json<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser)?;
    Ok(buf)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// In-memory store for tests/dev.
///
/// Saves can be made to fail on demand to exercise error paths.
#[derive(Debug)]
pub struct InMemoryStore<T> {
    slot: Mutex<Option<T>>,
    fail_saves: Mutex<bool>,
    saves: Mutex<u64>,
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            fail_saves: Mutex::new(false),
            saves: Mutex::new(0),
        }
    }

    pub fn with_snapshot(value: T) -> Self {
        let store = Self::new();
        *store.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        store
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> InMemoryStore<T> {
    /// The last saved snapshot.
    pub fn snapshot(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DurableStore<T> for InMemoryStore<T>
where
    T: Clone + Send,
{
    fn load(&self) -> SyncResult<Option<T>> {
        Ok(self.snapshot())
    }

    fn save(&self, value: &T) -> SyncResult<()> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(SyncError::io(
                "memory",
                std::io::Error::other("simulated save failure"),
            ));
        }
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
