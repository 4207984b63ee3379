//! Durable URL -> download-progress index with crash-tolerant reconciliation.
//!
//! The store treats `metadata.json` as a hint, never a source of truth: a
//! crash mid-write can corrupt it, and reconciliation against the real
//! on-disk file sizes at construction time recovers ground truth. The disk
//! size lookup is injected as a closure rather than a `CacheFileManager`
//! reference, so this module and `file_manager` do not depend on each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hash::CacheKey;

const METADATA_FILE_NAME: &str = "metadata.json";
const PERSIST_THROTTLE: Duration = Duration::from_secs(5);

/// Download progress for a single cached URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    #[serde(rename = "downloadedBytes")]
    pub downloaded_bytes: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "isComplete")]
    pub is_complete: bool,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "isHls")]
    pub is_hls: bool,
}

impl ProgressRecord {
    fn fresh(downloaded_bytes: u64, total_bytes: Option<u64>, is_hls: bool) -> Self {
        let is_complete = total_bytes.is_some_and(|t| downloaded_bytes >= t);
        Self {
            downloaded_bytes,
            total_bytes,
            is_complete,
            last_updated: Utc::now(),
            is_hls,
        }
    }
}

struct Inner {
    records: HashMap<String, ProgressRecord>,
    last_persisted_at: HashMap<String, Instant>,
}

/// Returns the on-disk size of a cached URL's file, or `None` if it doesn't
/// exist. Supplied by the facade at construction time, typically backed by
/// `CacheFileManager::file_size`.
pub type DiskSizeProbe = Box<dyn Fn(&str) -> Option<u64> + Send + Sync>;

pub struct CacheMetadataStore {
    path: PathBuf,
    disk_size: DiskSizeProbe,
    inner: Mutex<Inner>,
}

impl CacheMetadataStore {
    /// Reads and parses `metadata.json` under `cache_dir` if present (a
    /// parse failure is treated as "no prior state"), then reconciles every
    /// non-HLS entry against `disk_size`.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        disk_size: impl Fn(&str) -> Option<u64> + Send + Sync + 'static,
    ) -> Self {
        let path = cache_dir.into().join(METADATA_FILE_NAME);
        let mut records = Self::load(&path);
        Self::reconcile(&mut records, &disk_size);
        Self {
            path,
            disk_size: Box::new(disk_size),
            inner: Mutex::new(Inner {
                records,
                last_persisted_at: HashMap::new(),
            }),
        }
    }

    fn load(path: &std::path::Path) -> HashMap<String, ProgressRecord> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read metadata.json, starting empty");
                return HashMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse metadata.json, discarding");
                HashMap::new()
            }
        }
    }

    fn reconcile(
        records: &mut HashMap<String, ProgressRecord>,
        disk_size: &(impl Fn(&str) -> Option<u64> + ?Sized),
    ) {
        let mut to_drop = Vec::new();
        for (url, record) in records.iter_mut() {
            if record.is_hls {
                continue;
            }
            match disk_size(url) {
                None => to_drop.push(url.clone()),
                Some(size) => {
                    if size != record.downloaded_bytes {
                        record.downloaded_bytes = size;
                        if let Some(total) = record.total_bytes {
                            record.is_complete = size >= total;
                        }
                    }
                }
            }
        }
        for url in &to_drop {
            records.remove(url);
        }
        if !to_drop.is_empty() {
            debug!(count = to_drop.len(), "dropped stale metadata entries for missing files");
        }
    }

    /// Writes the in-memory record, then persists to disk if this write
    /// marks the record complete or at least 5 seconds have passed since
    /// the last persistence for this URL.
    pub fn update_progress(
        &self,
        url: &str,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        is_hls: bool,
    ) {
        let mut inner = self.inner.lock();
        let is_complete = total_bytes.is_some_and(|t| downloaded_bytes >= t);
        let record = inner
            .records
            .entry(url.to_owned())
            .or_insert_with(|| ProgressRecord::fresh(downloaded_bytes, total_bytes, is_hls));
        record.downloaded_bytes = downloaded_bytes;
        record.total_bytes = total_bytes;
        record.is_hls = is_hls;
        record.is_complete = is_complete;
        record.last_updated = Utc::now();

        let should_persist = is_complete
            || inner
                .last_persisted_at
                .get(url)
                .is_none_or(|t| t.elapsed() >= PERSIST_THROTTLE);

        if should_persist {
            self.persist_locked(&mut inner, url);
        }
    }

    /// Forces `is_complete = true` and persists immediately, regardless of
    /// the throttle. Used when completeness cannot be derived from
    /// `total_bytes` alone (e.g. a live HLS stream reaching its end list, or
    /// an MP4 response with no `Content-Length`).
    pub fn mark_complete(&self, url: &str) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let record = inner.records.entry(url.to_owned()).or_insert_with(|| {
            ProgressRecord::fresh(0, None, false)
        });
        record.is_complete = true;
        // Keep `is_complete ⇒ downloaded_bytes = total_bytes` holding even
        // when the caller never learned a total (e.g. no `Content-Length`).
        if record.total_bytes.is_none() {
            record.total_bytes = Some(record.downloaded_bytes);
        }
        record.last_updated = now;
        self.persist_locked(&mut inner, url);
    }

    pub fn get(&self, url: &str) -> Option<ProgressRecord> {
        self.inner.lock().records.get(url).cloned()
    }

    pub fn is_complete(&self, url: &str) -> bool {
        self.get(url).map(|r| r.is_complete).unwrap_or(false)
    }

    pub fn downloaded_bytes(&self, url: &str) -> u64 {
        self.get(url).map(|r| r.downloaded_bytes).unwrap_or(0)
    }

    /// Removes the entry for `url` and persists the removal.
    pub fn remove(&self, url: &str) {
        let mut inner = self.inner.lock();
        if inner.records.remove(url).is_some() {
            inner.last_persisted_at.remove(url);
            self.persist_all_locked(&inner);
        }
    }

    /// Removes whichever entry hashes to `key`, if any. Used by the
    /// evictor, which enumerates the cache by hash, not by URL.
    pub fn remove_by_hash(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        let Some(url) = inner
            .records
            .keys()
            .find(|url| CacheKey::from_url(url) == key)
            .cloned()
        else {
            return;
        };
        inner.records.remove(&url);
        inner.last_persisted_at.remove(&url);
        self.persist_all_locked(&inner);
    }

    /// Drops every record and truncates `metadata.json`.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.last_persisted_at.clear();
        self.persist_all_locked(&inner);
    }

    fn persist_locked(&self, inner: &mut Inner, url: &str) {
        inner.last_persisted_at.insert(url.to_owned(), Instant::now());
        self.persist_all_locked(inner);
    }

    fn persist_all_locked(&self, inner: &Inner) {
        match serde_json::to_vec_pretty(&inner.records) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "failed to persist metadata.json");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize metadata store");
            }
        }
    }

    /// Disk size as reported by the injected probe, for reconciliation or
    /// diagnostics.
    pub fn disk_size(&self, url: &str) -> Option<u64> {
        (self.disk_size)(url)
    }
}
