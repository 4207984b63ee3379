//! LRU eviction over mixed MP4-file and HLS-directory entries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::CacheError;
use crate::file_manager::{CacheFileManager, EntryKind};
use crate::metadata::CacheMetadataStore;

const THROTTLE: Duration = Duration::from_secs(30);
const TARGET_FRACTION: f64 = 0.8;

pub struct Evictor {
    file_manager: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    max_bytes: u64,
    in_flight: AtomicBool,
    last_run: Mutex<Option<Instant>>,
}

impl Evictor {
    pub fn new(
        file_manager: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
        max_bytes: u64,
    ) -> Self {
        Self {
            file_manager,
            metadata,
            max_bytes,
            in_flight: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    /// Runs eviction unconditionally. Returns the number of entries
    /// deleted.
    pub fn evict_if_needed(&self) -> Result<usize, CacheError> {
        let mut entries = self.file_manager.enumerate_entries()?;
        let total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_bytes {
            return Ok(0);
        }

        entries.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed));

        let target = (self.max_bytes as f64 * TARGET_FRACTION) as u64;
        let mut running_total = total;
        let mut deleted = 0;

        for entry in entries {
            if running_total < target {
                break;
            }
            let result = match entry.kind {
                EntryKind::Mp4File => self.file_manager.delete_by_hash(entry.key),
                EntryKind::HlsDirectory => self.file_manager.delete_hls_dir_by_hash(entry.key),
            };
            match result {
                Ok(()) => {
                    self.metadata.remove_by_hash(entry.key);
                    running_total = running_total.saturating_sub(entry.size);
                    deleted += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "failed to evict entry, will retry next pass");
                }
            }
        }

        info!(deleted, remaining_bytes = running_total, "eviction pass complete");
        Ok(deleted)
    }

    /// No-ops if an eviction is already running or fewer than 30 seconds
    /// have passed since the last one finished.
    pub fn evict_if_needed_throttled(&self) -> Result<usize, CacheError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }

        let should_run = {
            let last_run = self.last_run.lock();
            last_run.is_none_or(|t| t.elapsed() >= THROTTLE)
        };
        if !should_run {
            self.in_flight.store(false, Ordering::SeqCst);
            return Ok(0);
        }

        let result = self.evict_if_needed();
        *self.last_run.lock() = Some(Instant::now());
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}
