//! Durable small-document caches
//!
//! Both on-disk caches (cadence classifications and backfill start times) are
//! whole JSON documents that are loaded once at startup and overwritten
//! wholesale on every persist. Writes go to a sibling temp file which is then
//! renamed over the target, so readers never observe a half-written file.
//! Saves through one store are serialized on the temp file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{FundwatchError, Result};

/// Load/save a whole cache document
pub trait CacheStore<T>: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet
    fn load(&self) -> Result<Option<T>>;

    fn save(&self, value: &T) -> Result<()>;
}

/// JSON document on local disk
pub struct JsonFileStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl<T> CacheStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>> {
        if !self.path.exists() {
            debug!("No cache file at {}", self.path.display());
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let value = serde_json::from_str(&raw)?;
        Ok(Some(value))
    }

    fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(value)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tmp = self.temp_path();
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            FundwatchError::Persistence(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!("Cache persisted to {}", self.path.display());
        Ok(())
    }
}

/// In-process store, counts saves so callers can assert persistence cadence
pub struct MemoryStore<T> {
    value: Mutex<Option<T>>,
    saves: AtomicUsize,
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<T> {
        self.value.lock().ok().and_then(|v| v.clone())
    }
}

impl<T: Clone> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheStore<T> for MemoryStore<T>
where
    T: Clone + Send,
{
    fn load(&self) -> Result<Option<T>> {
        let guard = self
            .value
            .lock()
            .map_err(|_| FundwatchError::Persistence("memory store poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn save(&self, value: &T) -> Result<()> {
        let mut guard = self
            .value
            .lock()
            .map_err(|_| FundwatchError::Persistence("memory store poisoned".to_string()))?;
        *guard = Some(value.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
