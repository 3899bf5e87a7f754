//! Best-effort on-disk cache of parsed document summaries.
//!
//! Entries are keyed by workspace-relative path and remember the uri and modification time they
//! were computed for; a lookup with a different mtime or uri is a miss. The whole map is written
//! as one JSON file in the first workspace root. A missing, unreadable or corrupt file is simply
//! an empty cache.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{error::NotedownError, pipeline::DocumentRecord};

pub const CACHE_FILE: &str = ".notedown-cache.json";
const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub uri: String,
    pub mtime: i64,
    pub summary: DocumentRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
pub struct DocumentCache {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, CacheEntry>>,
    dirty: AtomicBool,
}

impl DocumentCache {
    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Cache file location for a workspace root.
    pub fn path_for_root(root: &Path) -> PathBuf {
        root.join(CACHE_FILE)
    }

    /// Read the cache file at `path`; any failure yields an empty cache bound to `path`.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) if file.version == CACHE_FORMAT_VERSION => {
                    tracing::debug!(
                        "[Cache] Loaded {} entries from {:?}",
                        file.entries.len(),
                        path
                    );
                    file.entries
                }
                Ok(file) => {
                    tracing::warn!(
                        "[Cache] Ignoring cache {:?} with unknown format version {}",
                        path,
                        file.version
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    tracing::warn!("[Cache] Ignoring corrupt cache {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("[Cache] Could not read {:?}: {}", path, e);
                BTreeMap::new()
            }
        };
        DocumentCache {
            path: Some(path),
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Cached summary for `rel_path`, if it was computed for the same uri and mtime.
    pub fn get(&self, rel_path: &str, uri: &str, mtime: i64) -> Option<DocumentRecord> {
        self.entries
            .read()
            .get(rel_path)
            .filter(|entry| entry.mtime == mtime && entry.uri == uri)
            .map(|entry| entry.summary.clone())
    }

    pub fn insert(&self, rel_path: &str, uri: &str, mtime: i64, summary: DocumentRecord) {
        self.entries.write().insert(
            rel_path.to_string(),
            CacheEntry {
                uri: uri.to_string(),
                mtime,
                summary,
            },
        );
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn invalidate(&self, rel_path: &str) -> bool {
        let removed = self.entries.write().remove(rel_path).is_some();
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the cache to disk if it changed since the last flush.
    ///
    /// The file is written next to its destination and renamed into place.
    pub fn flush(&self) -> Result<bool, NotedownError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries: self.entries.read().clone(),
        };
        let result = serde_json::to_string(&file)
            .map_err(NotedownError::from)
            .and_then(|json| {
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, json)?;
                std::fs::rename(&tmp, path)?;
                Ok(())
            });
        match result {
            Ok(()) => {
                tracing::debug!("[Cache] Flushed {} entries to {:?}", file.entries.len(), path);
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(NotedownError::Cache(format!("flush to {path:?} failed: {e}")))
            }
        }
    }
}

/// Background task flushing a [`DocumentCache`] periodically and once more on shutdown.
pub struct CacheFlusher;

impl CacheFlusher {
    pub fn spawn(
        cache: Arc<DocumentCache>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.flush() {
                            tracing::warn!("[CacheFlusher] {}", e);
                        }
                    }
                }
            }
            if let Err(e) = cache.flush() {
                tracing::warn!("[CacheFlusher] Final flush failed: {}", e);
            }
            tracing::debug!("[CacheFlusher] Stopped");
        })
    }
}
