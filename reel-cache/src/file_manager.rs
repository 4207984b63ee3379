//! Maps a cache key to an on-disk path, enumerates entries, and performs the
//! filesystem side of deletion and eviction.

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use tracing::warn;

use crate::error::CacheError;
use crate::hash::CacheKey;

const CACHE_DIR_NAME: &str = "video_cache";
const HLS_DIR_NAME: &str = "hls";

/// Whether an enumerated entry is a single MP4 file or an HLS directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Mp4File,
    HlsDirectory,
}

/// One cached resource as seen by the evictor.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub kind: EntryKind,
    pub key: CacheKey,
    pub size: u64,
    pub last_accessed: SystemTime,
}

/// Maps cache keys to on-disk paths under a single cache root.
///
/// `cache_dir()` is created lazily on first use and memoized; every other
/// operation is a pure path computation or a direct filesystem call.
pub struct CacheFileManager {
    root: OnceLock<PathBuf>,
    base: PathBuf,
}

impl Default for CacheFileManager {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl CacheFileManager {
    /// Create a manager rooted under `base/video_cache` (`base` is normally
    /// the OS temp directory; tests pass a `tempfile::TempDir` path instead).
    pub fn new(base: PathBuf) -> Self {
        Self {
            root: OnceLock::new(),
            base,
        }
    }

    /// Returns `<base>/video_cache`, creating it (and its `hls/`
    /// subdirectory) on first call.
    pub fn cache_dir(&self) -> Result<&Path, CacheError> {
        if let Some(dir) = self.root.get() {
            return Ok(dir.as_path());
        }
        let dir = self.base.join(CACHE_DIR_NAME);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join(HLS_DIR_NAME))?;
        Ok(self.root.get_or_init(|| dir).as_path())
    }

    /// Pure: `<cache_dir>/<hash(url)>.mp4`. Does not touch the filesystem.
    pub fn file_path(&self, url: &str) -> Result<PathBuf, CacheError> {
        Ok(self
            .cache_dir()?
            .join(format!("{}.mp4", CacheKey::from_url(url))))
    }

    /// `<cache_dir>/hls/<hash(url)>/`
    pub fn hls_dir(&self, url: &str) -> Result<PathBuf, CacheError> {
        Ok(self
            .cache_dir()?
            .join(HLS_DIR_NAME)
            .join(CacheKey::from_url(url).to_hex()))
    }

    /// Like `hls_dir`, but creates the directory if it doesn't exist yet.
    pub fn ensure_hls_dir(&self, url: &str) -> Result<PathBuf, CacheError> {
        let dir = self.hls_dir(url)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn exists(&self, url: &str) -> Result<bool, CacheError> {
        Ok(self.file_path(url)?.exists())
    }

    pub fn file_size(&self, url: &str) -> Result<u64, CacheError> {
        let path = self.file_path(url)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent: creates a zero-byte file if absent, never truncates an
    /// existing one.
    pub fn ensure_file(&self, url: &str) -> Result<PathBuf, CacheError> {
        let path = self.file_path(url)?;
        if !path.exists() {
            std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
        }
        Ok(path)
    }

    /// Removes the on-disk file (if any). Metadata removal is the caller's
    /// responsibility (the store and the file manager are deliberately
    /// decoupled; see `CacheMetadataStore::remove`).
    pub fn delete(&self, url: &str) -> Result<(), CacheError> {
        let path = self.file_path(url)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the HLS directory for a URL, if present.
    pub fn delete_hls_dir(&self, url: &str) -> Result<(), CacheError> {
        let dir = self.hls_dir(url)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the MP4 file identified by `key` directly, bypassing the
    /// URL -> hash recomputation (the evictor only has the hash on hand).
    pub fn delete_by_hash(&self, key: CacheKey) -> Result<(), CacheError> {
        let path = self.cache_dir()?.join(format!("{key}.mp4"));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the HLS directory identified by `key` directly.
    pub fn delete_hls_dir_by_hash(&self, key: CacheKey) -> Result<(), CacheError> {
        let dir = self.cache_dir()?.join(HLS_DIR_NAME).join(key.to_hex());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wipes the entire cache directory. The metadata store is cleared by
    /// the caller (typically the facade that owns both).
    pub fn clear_all(&self) -> Result<(), CacheError> {
        let dir = self.cache_dir()?;
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.root.get().map(|_| ());
        std::fs::create_dir_all(dir)?;
        std::fs::create_dir_all(dir.join(HLS_DIR_NAME))?;
        Ok(())
    }

    /// Recursive sum of regular-file lengths under the cache directory.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        let dir = self.cache_dir()?;
        Ok(dir_size(dir))
    }

    /// Sets the file's access time to now. Failures are logged and
    /// swallowed, per the enumeration/probe failure model.
    pub fn update_access_time(&self, url: &str) {
        let path = match self.file_path(url) {
            Ok(p) => p,
            Err(e) => {
                warn!(url, error = %e, "failed to resolve path for access-time update");
                return;
            }
        };
        if let Err(e) = touch_access_time(&path) {
            warn!(path = %path.display(), error = %e, "failed to update access time");
        }
    }

    /// One entry per MP4 file directly under the cache root, and one entry
    /// per direct child directory of `hls/`. I/O errors on a per-entry probe
    /// are logged and skipped, never propagated.
    pub fn enumerate_entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let root = self.cache_dir()?;
        let mut entries = Vec::new();

        let read_dir = match std::fs::read_dir(root) {
            Ok(rd) => rd,
            Err(e) => return Err(e.into()),
        };
        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(CacheKey::from_hex)
            else {
                continue;
            };
            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable mp4 entry");
                    continue;
                }
            };
            entries.push(CacheEntry {
                kind: EntryKind::Mp4File,
                key,
                size: meta.len(),
                last_accessed: access_time(&meta),
            });
        }

        let hls_root = root.join(HLS_DIR_NAME);
        if let Ok(read_dir) = std::fs::read_dir(&hls_root) {
            for item in read_dir.flatten() {
                let path = item.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(key) = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .and_then(CacheKey::from_hex)
                else {
                    continue;
                };
                let (size, last_accessed) = match dir_size_and_latest_access(&path) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable hls entry");
                        continue;
                    }
                };
                entries.push(CacheEntry {
                    kind: EntryKind::HlsDirectory,
                    key,
                    size,
                    last_accessed,
                });
            }
        }

        Ok(entries)
    }
}

fn access_time(meta: &std::fs::Metadata) -> SystemTime {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let secs = meta.atime();
        let nanos = meta.atime_nsec().max(0) as u32;
        if secs >= 0 {
            return SystemTime::UNIX_EPOCH + std::time::Duration::new(secs as u64, nanos);
        }
        SystemTime::UNIX_EPOCH
    }
    #[cfg(not(unix))]
    {
        meta.accessed()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

fn touch_access_time(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    let times = FileTimes::new().set_accessed(SystemTime::now());
    file.set_times(times)
}

fn dir_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return 0;
    };
    for item in read_dir.flatten() {
        let path = item.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = std::fs::metadata(&path) {
            total += meta.len();
        }
    }
    total
}

fn dir_size_and_latest_access(dir: &Path) -> std::io::Result<(u64, SystemTime)> {
    let mut total = 0u64;
    let mut latest = SystemTime::UNIX_EPOCH;
    for entry in walk_files(dir)? {
        let meta = std::fs::metadata(&entry)?;
        total += meta.len();
        let at = access_time(&meta);
        if at > latest {
            latest = at;
        }
    }
    Ok((total, latest))
}

fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        if path.is_dir() {
            files.extend(walk_files(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}
