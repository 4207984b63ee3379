//! Turns a remote HLS URL into a locally materializing playlist.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::downloader::{PlaylistFetcher, ProgressiveDownloader};
use crate::error::CacheError;
use crate::file_manager::CacheFileManager;
use crate::hls::parser::{self, MediaPlaylist, Playlist};
use crate::metadata::CacheMetadataStore;

const INITIAL_PREFETCH_DEFAULT: usize = 3;
const REFILL_BATCH: usize = 2;
const MIN_REFRESH_SECS: u64 = 3;
const MAX_REFRESH_SECS: u64 = 30;
const MIN_BACKOFF_SECS: u64 = 3;
const MAX_BACKOFF_SECS: u64 = 60;

/// Result of `get_playable_path`.
#[derive(Debug, Clone)]
pub struct PlayableHls {
    pub playlist_path: PathBuf,
    pub is_fully_cached: bool,
    pub total_segments: u64,
    pub cached_segments: u64,
}

struct HlsEntry {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct HlsCacheManager {
    fetcher: Arc<dyn PlaylistFetcher>,
    file_manager: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    state: Mutex<HashMap<String, HlsEntry>>,
}

impl HlsCacheManager {
    pub fn new(
        downloader: ProgressiveDownloader,
        file_manager: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
    ) -> Self {
        Self::with_fetcher(Arc::new(downloader), file_manager, metadata)
    }

    /// Like `new`, but takes the playlist/segment fetcher directly. Used by
    /// tests to substitute a `MockPlaylistFetcher` for the live network.
    pub fn with_fetcher(
        fetcher: Arc<dyn PlaylistFetcher>,
        file_manager: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
    ) -> Self {
        Self {
            fetcher,
            file_manager,
            metadata,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_playable_path(
        &self,
        hls_url: &str,
        prefetch_segments: Option<usize>,
        target_bandwidth: Option<u64>,
        headers: Option<HeaderMap>,
    ) -> Result<PlayableHls, CacheError> {
        let local_dir = self.file_manager.ensure_hls_dir(hls_url)?;
        let playlist_path = local_dir.join("playlist.m3u8");

        if playlist_path.exists() {
            let record = self.metadata.get(hls_url);
            let (cached, total) = record
                .as_ref()
                .map(|r| (r.downloaded_bytes, r.total_bytes.unwrap_or(0)))
                .unwrap_or((0, 0));
            return Ok(PlayableHls {
                playlist_path,
                is_fully_cached: record.map(|r| r.is_complete).unwrap_or(false),
                total_segments: total,
                cached_segments: cached,
            });
        }

        let body = self.fetcher.fetch_text(hls_url).await?;
        let media = match parser::parse(&body, hls_url)? {
            Playlist::Media(media) => media,
            Playlist::Master(master) => {
                let variant = match target_bandwidth {
                    Some(target) => master.closest_to(target),
                    None => master.best_variant(),
                }
                .ok_or_else(|| CacheError::playlist("master playlist has no variants"))?;
                let variant_body = self.fetcher.fetch_text(&variant.url).await?;
                match parser::parse(&variant_body, &variant.url)? {
                    Playlist::Media(media) => media,
                    Playlist::Master(_) => {
                        return Err(CacheError::playlist(
                            "variant playlist is itself a master playlist",
                        ));
                    }
                }
            }
        };

        let total_segments = media.segments.len() as u64;
        let cached_segments = count_cached(&media, &local_dir);
        let is_live = media.is_live;

        self.metadata
            .update_progress(hls_url, cached_segments, Some(total_segments), true);
        write_local_playlist(&media, &local_dir, &playlist_path)?;

        let budget = prefetch_segments.unwrap_or(INITIAL_PREFETCH_DEFAULT);
        self.spawn_segment_loop(hls_url, media, local_dir.clone(), playlist_path.clone(), budget, headers);

        Ok(PlayableHls {
            playlist_path,
            is_fully_cached: cached_segments == total_segments && !is_live,
            total_segments,
            cached_segments,
        })
    }

    fn spawn_segment_loop(
        &self,
        hls_url: &str,
        media: MediaPlaylist,
        local_dir: PathBuf,
        playlist_path: PathBuf,
        prefetch_segments: usize,
        headers: Option<HeaderMap>,
    ) {
        let mut state = self.state.lock();
        if let Some(prev) = state.remove(hls_url) {
            prev.token.cancel();
            prev.handle.abort();
        }

        let token = CancellationToken::new();
        let fetcher = self.fetcher.clone();
        let metadata = self.metadata.clone();
        let url = hls_url.to_owned();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            run_segment_loop(
                fetcher,
                metadata,
                url,
                media,
                local_dir,
                playlist_path,
                prefetch_segments,
                headers,
                task_token,
            )
            .await;
        });

        state.insert(hls_url.to_owned(), HlsEntry { token, handle });
    }

    /// Cancels the background segment/refresh loop for `url` and forgets it.
    pub fn cancel(&self, url: &str) {
        if let Some(entry) = self.state.lock().remove(url) {
            entry.token.cancel();
            entry.handle.abort();
        }
    }

    /// Cancels every background segment/refresh loop.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        for (_, entry) in state.drain() {
            entry.token.cancel();
            entry.handle.abort();
        }
    }

    pub fn is_active(&self, url: &str) -> bool {
        self.state.lock().contains_key(url)
    }

    /// Cancels the loop, deletes the cache directory, and removes the
    /// metadata record.
    pub fn clear_cache(&self, url: &str) -> Result<(), CacheError> {
        self.cancel(url);
        self.file_manager.delete_hls_dir(url)?;
        self.metadata.remove(url);
        Ok(())
    }
}

fn count_cached(media: &MediaPlaylist, local_dir: &Path) -> u64 {
    media
        .segments
        .iter()
        .filter(|s| is_nonempty_file(&segment_path(local_dir, s.index)))
        .count() as u64
}

fn segment_path(local_dir: &Path, index: u64) -> PathBuf {
    local_dir.join(format!("segment_{index}.ts"))
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn write_local_playlist(
    media: &MediaPlaylist,
    local_dir: &Path,
    playlist_path: &Path,
) -> Result<(), CacheError> {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", media.target_duration));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", media.media_sequence));

    for segment in &media.segments {
        out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration));
        let local = segment_path(local_dir, segment.index);
        if is_nonempty_file(&local) {
            out.push_str(&local.to_string_lossy());
        } else {
            out.push_str(&segment.url);
        }
        out.push('\n');
    }

    if !media.is_live {
        out.push_str("#EXT-X-ENDLIST\n");
    }

    std::fs::write(playlist_path, out).map_err(CacheError::from)
}

#[allow(clippy::too_many_arguments)]
async fn run_segment_loop(
    fetcher: Arc<dyn PlaylistFetcher>,
    metadata: Arc<CacheMetadataStore>,
    url: String,
    mut media: MediaPlaylist,
    local_dir: PathBuf,
    playlist_path: PathBuf,
    initial_budget: usize,
    headers: Option<HeaderMap>,
    token: CancellationToken,
) {
    let _ = headers; // segment requests currently reuse the pool's default headers
    let mut skipped: HashSet<u64> = HashSet::new();
    let mut batch_remaining = initial_budget.max(1);
    let mut backoff_secs = MIN_BACKOFF_SECS;

    loop {
        if token.is_cancelled() {
            return;
        }

        let next = media
            .segments
            .iter()
            .find(|s| !skipped.contains(&s.index) && !is_nonempty_file(&segment_path(&local_dir, s.index)));

        let Some(segment) = next.cloned() else {
            if !media.is_live {
                metadata.mark_complete(&url);
                return;
            }

            let wait = Duration::from_secs(media.target_duration.clamp(MIN_REFRESH_SECS, MAX_REFRESH_SECS));
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match fetcher.fetch_text(&url).await {
                Ok(body) => match parser::parse(&body, &url) {
                    Ok(Playlist::Media(refreshed)) => {
                        media = refreshed;
                        skipped.clear();
                        backoff_secs = MIN_BACKOFF_SECS;
                        let cached = count_cached(&media, &local_dir);
                        metadata.update_progress(&url, cached, Some(media.segments.len() as u64), true);
                        if let Err(e) = write_local_playlist(&media, &local_dir, &playlist_path) {
                            warn!(url, error = %e, "failed to rewrite local playlist after refresh");
                        }
                    }
                    Ok(Playlist::Master(_)) => {
                        warn!(url, "live refresh returned a master playlist, ignoring");
                    }
                    Err(e) => {
                        warn!(url, error = %e, "failed to parse refreshed playlist");
                    }
                },
                Err(e) => {
                    debug!(url, error = %e, backoff_secs, "live playlist refresh failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
            continue;
        };

        let dest = segment_path(&local_dir, segment.index);
        match fetcher.fetch_to_file(&segment.url, &dest).await {
            Ok(()) => {
                let cached = count_cached(&media, &local_dir);
                metadata.update_progress(&url, cached, Some(media.segments.len() as u64), true);
                if let Err(e) = write_local_playlist(&media, &local_dir, &playlist_path) {
                    warn!(url, error = %e, "failed to rewrite local playlist after segment");
                }
            }
            Err(e) => {
                warn!(url, index = segment.index, error = %e, "segment download failed, skipping");
                skipped.insert(segment.index);
            }
        }

        batch_remaining -= 1;
        if batch_remaining == 0 {
            batch_remaining = REFILL_BATCH;
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::parser::Segment;

    fn sample_media(live: bool) -> MediaPlaylist {
        MediaPlaylist {
            segments: vec![
                Segment { url: "https://h/seg0.ts".into(), duration: 4.0, index: 0 },
                Segment { url: "https://h/seg1.ts".into(), duration: 4.0, index: 1 },
            ],
            target_duration: 4,
            media_sequence: 0,
            is_live: live,
        }
    }

    #[test]
    fn write_local_playlist_falls_back_to_remote_url_when_uncached() {
        let tmp = tempfile::tempdir().unwrap();
        let playlist_path = tmp.path().join("playlist.m3u8");
        let media = sample_media(false);
        write_local_playlist(&media, tmp.path(), &playlist_path).unwrap();
        let text = std::fs::read_to_string(&playlist_path).unwrap();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("https://h/seg0.ts"));
        assert!(text.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn write_local_playlist_prefers_existing_local_segment() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("segment_0.ts"), b"data").unwrap();
        let playlist_path = tmp.path().join("playlist.m3u8");
        let media = sample_media(true);
        write_local_playlist(&media, tmp.path(), &playlist_path).unwrap();
        let text = std::fs::read_to_string(&playlist_path).unwrap();
        assert!(text.contains(&tmp.path().join("segment_0.ts").to_string_lossy().to_string()));
        assert!(text.contains("https://h/seg1.ts"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn count_cached_only_counts_nonempty_local_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("segment_0.ts"), b"data").unwrap();
        std::fs::write(tmp.path().join("segment_1.ts"), b"").unwrap();
        let media = sample_media(false);
        assert_eq!(count_cached(&media, tmp.path()), 1);
    }

    // Mirrors spec.md §8 scenario 4 (HLS parse + local playlist): a VOD
    // playlist with three segments should end up with every #EXTINF line
    // pointing at an existing local segment file, and the whole entry
    // marked complete once the background loop drains it.
    #[tokio::test]
    async fn get_playable_path_materializes_every_segment_for_a_vod_playlist() {
        use crate::downloader::MockPlaylistFetcher;
        use crate::metadata::CacheMetadataStore;

        const PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:9.009,\n\
segment0.ts\n\
#EXTINF:9.009,\n\
segment1.ts\n\
#EXTINF:3.003,\n\
segment2.ts\n\
#EXT-X-ENDLIST\n";

        let mut mock = MockPlaylistFetcher::new();
        mock.expect_fetch_text()
            .withf(|url: &str| url == "https://h/p.m3u8")
            .returning(|_| Ok(PLAYLIST.to_owned()));
        mock.expect_fetch_to_file().returning(|_url: &str, path: &Path| {
            std::fs::write(path, b"segment-bytes").unwrap();
            Ok(())
        });

        let tmp = tempfile::tempdir().unwrap();
        let file_manager = Arc::new(CacheFileManager::new(tmp.path().to_path_buf()));
        let cache_dir = file_manager.cache_dir().unwrap().to_path_buf();
        let metadata = Arc::new(CacheMetadataStore::new(cache_dir, |_: &str| -> Option<u64> { None }));
        let manager = HlsCacheManager::with_fetcher(Arc::new(mock), file_manager, metadata.clone());

        let result = manager
            .get_playable_path("https://h/p.m3u8", Some(3), None, None)
            .await
            .unwrap();
        assert_eq!(result.total_segments, 3);

        for _ in 0..200 {
            if metadata.is_complete("https://h/p.m3u8") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(metadata.is_complete("https://h/p.m3u8"));

        let playlist_text = std::fs::read_to_string(&result.playlist_path).unwrap();
        assert_eq!(playlist_text.matches("#EXTINF").count(), 3);
        assert!(!playlist_text.contains("https://h/segment"));
        assert!(playlist_text.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn get_playable_path_returns_existing_local_playlist_without_refetching() {
        use crate::downloader::MockPlaylistFetcher;
        use crate::metadata::CacheMetadataStore;

        let mut mock = MockPlaylistFetcher::new();
        mock.expect_fetch_text().never();
        mock.expect_fetch_to_file().never();

        let tmp = tempfile::tempdir().unwrap();
        let file_manager = Arc::new(CacheFileManager::new(tmp.path().to_path_buf()));
        let cache_dir = file_manager.cache_dir().unwrap().to_path_buf();
        let metadata = Arc::new(CacheMetadataStore::new(cache_dir, |_: &str| -> Option<u64> { None }));

        let local_dir = file_manager.ensure_hls_dir("https://h/p.m3u8").unwrap();
        std::fs::write(local_dir.join("playlist.m3u8"), "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();
        metadata.update_progress("https://h/p.m3u8", 3, Some(3), true);

        let manager = HlsCacheManager::with_fetcher(Arc::new(mock), file_manager, metadata);
        let result = manager
            .get_playable_path("https://h/p.m3u8", None, None, None)
            .await
            .unwrap();
        assert!(result.is_fully_cached);
        assert_eq!(result.playlist_path, local_dir.join("playlist.m3u8"));
    }
}
