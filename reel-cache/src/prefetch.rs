//! Scroll-driven prefetch scheduling: bounded concurrency, two priority
//! queues, and network-adaptive fan-out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::downloader::ProgressiveDownloader;
use crate::file_manager::CacheFileManager;
use crate::hls::HlsCacheManager;
use crate::metadata::{CacheMetadataStore, ProgressRecord};
use crate::network::{NetworkQualityMonitor, NetworkType};

const MP4_PLAYABLE_THRESHOLD: u64 = 128 * 1024;
const THRESHOLD_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn is_hls_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.ends_with(".m3u8") || lower.contains(".m3u8?")
}

#[derive(Default)]
struct QueueState {
    in_flight: HashSet<String>,
    queued: HashSet<String>,
    high: VecDeque<String>,
    low: VecDeque<String>,
}

struct Inner {
    downloader: ProgressiveDownloader,
    hls: Arc<HlsCacheManager>,
    file_manager: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    network: Arc<NetworkQualityMonitor>,
    configured_max_concurrent: usize,
    state: tokio::sync::Mutex<QueueState>,
}

/// Coordinates MP4 and HLS downloads against a player's scroll position.
/// Cheap to clone: every clone shares the same queues and in-flight table.
#[derive(Clone)]
pub struct ReelPrefetchController {
    inner: Arc<Inner>,
}

impl ReelPrefetchController {
    pub fn new(
        downloader: ProgressiveDownloader,
        hls: Arc<HlsCacheManager>,
        file_manager: Arc<CacheFileManager>,
        metadata: Arc<CacheMetadataStore>,
        network: Arc<NetworkQualityMonitor>,
        configured_max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                downloader,
                hls,
                file_manager,
                metadata,
                network,
                configured_max_concurrent,
                state: tokio::sync::Mutex::new(QueueState::default()),
            }),
        }
    }

    fn effective_max_concurrent(&self) -> usize {
        self.inner
            .configured_max_concurrent
            .min(self.inner.network.prefetch_config().max_concurrent)
    }

    /// Resolves a playable local path for `url`, falling back to the
    /// remote URL itself on any error so playback can still attempt to
    /// stream directly.
    pub async fn get_playable_path(&self, url: &str, headers: Option<HeaderMap>) -> String {
        self.get_playable_path_with_priority(url, headers, true).await
    }

    async fn get_playable_path_with_priority(
        &self,
        url: &str,
        headers: Option<HeaderMap>,
        high_priority: bool,
    ) -> String {
        if is_hls_url(url) {
            return match self.inner.hls.get_playable_path(url, None, None, headers).await {
                Ok(playable) => playable.playlist_path.to_string_lossy().into_owned(),
                Err(e) => {
                    warn!(url, error = %e, "HLS playable path failed, falling back to remote URL");
                    url.to_owned()
                }
            };
        }

        self.get_mp4_playable_path(url, headers, high_priority).await
    }

    async fn get_mp4_playable_path(
        &self,
        url: &str,
        headers: Option<HeaderMap>,
        high_priority: bool,
    ) -> String {
        let path = match self.inner.file_manager.ensure_file(url) {
            Ok(p) => p,
            Err(e) => {
                warn!(url, error = %e, "failed to ensure cache file, falling back to remote URL");
                return url.to_owned();
            }
        };
        let path_string = path.to_string_lossy().into_owned();

        if self.inner.metadata.is_complete(url) {
            return path_string;
        }

        let size = self.inner.file_manager.file_size(url).unwrap_or(0);

        if size >= MP4_PLAYABLE_THRESHOLD {
            self.start_background_resume(url, path, size, headers).await;
            return path_string;
        }

        if self.try_reserve_slot(url).await {
            let min_bytes = ProgressiveDownloader::default_min_bytes();
            let handle = self
                .inner
                .downloader
                .download_and_wait_for_bytes(url, path, size, min_bytes, headers);
            let (result, progress) = handle.wait_with_timeout(THRESHOLD_WAIT_TIMEOUT).await;
            self.spawn_progress_consumer(url.to_owned(), progress);
            if let Err(e) = result {
                debug!(url, error = %e, "threshold-wait download did not reach min_bytes in time, returning path anyway");
            }
        } else {
            self.enqueue(url, high_priority).await;
        }

        path_string
    }

    /// Starts a resumed background download if `url` isn't already
    /// in-flight; otherwise a no-op.
    async fn start_background_resume(
        &self,
        url: &str,
        path: std::path::PathBuf,
        start_byte: u64,
        headers: Option<HeaderMap>,
    ) {
        {
            let mut state = self.inner.state.lock().await;
            if !state.in_flight.insert(url.to_owned()) {
                return;
            }
        }
        let progress = self.inner.downloader.download(url, path, start_byte, headers);
        self.spawn_progress_consumer(url.to_owned(), progress);
    }

    async fn try_reserve_slot(&self, url: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.in_flight.contains(url) {
            return false;
        }
        if state.in_flight.len() >= self.effective_max_concurrent() {
            return false;
        }
        state.in_flight.insert(url.to_owned());
        true
    }

    async fn enqueue(&self, url: &str, high_priority: bool) {
        let mut state = self.inner.state.lock().await;
        if state.in_flight.contains(url) || state.queued.contains(url) {
            return;
        }
        state.queued.insert(url.to_owned());
        if high_priority {
            state.high.push_back(url.to_owned());
        } else {
            state.low.push_back(url.to_owned());
        }
    }

    fn spawn_progress_consumer(
        &self,
        url: String,
        mut progress: crate::downloader::DownloadProgressStream,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(item) = progress.next().await {
                match item {
                    Ok(p) => {
                        this.inner
                            .metadata
                            .update_progress(&url, p.downloaded_bytes, p.total_bytes, false);
                        // `update_progress` only derives completion from `total_bytes`,
                        // which is absent for a response without `Content-Length`. Honor
                        // the stream's own terminal signal so such a download is still
                        // recorded as complete instead of looking perpetually partial.
                        if p.is_complete {
                            this.inner.metadata.mark_complete(&url);
                        }
                    }
                    Err(e) => {
                        debug!(url, error = %e, "background download ended with an error");
                        break;
                    }
                }
            }
            this.release_slot_and_promote(&url).await;
        });
    }

    async fn release_slot_and_promote(&self, url: &str) {
        let next = {
            let mut state = self.inner.state.lock().await;
            state.in_flight.remove(url);
            let next = state.high.pop_front().or_else(|| state.low.pop_front());
            if let Some(n) = &next {
                state.queued.remove(n);
            }
            next
        };
        if let Some(next_url) = next {
            let this = self.clone();
            tokio::spawn(async move {
                this.get_playable_path(&next_url, None).await;
            });
        }
    }

    /// Resolves effective prefetch counts, cancels any in-flight URL that
    /// scrolled out of range, then fetches newly in-range URLs ahead
    /// before behind.
    pub async fn on_scroll_update(
        &self,
        urls: &[String],
        current_index: usize,
        prefetch_count: Option<usize>,
        prefetch_behind: Option<usize>,
        keep_range: Option<usize>,
        headers: Option<HeaderMap>,
    ) {
        let config = self.inner.network.prefetch_config();
        let ahead = prefetch_count.unwrap_or(config.ahead);
        let behind = prefetch_behind.unwrap_or(config.behind);
        let keep = keep_range.unwrap_or(config.keep);

        let in_flight: Vec<String> = self.inner.state.lock().await.in_flight.iter().cloned().collect();
        for url in in_flight {
            let index = urls.iter().position(|u| u == &url);
            let out_of_range = match index {
                None => true,
                Some(idx) => idx.abs_diff(current_index) > keep,
            };
            if out_of_range {
                self.cancel_download(&url).await;
            }
        }

        for offset in 1..=ahead {
            let idx = current_index + offset;
            if let Some(url) = urls.get(idx) {
                let this = self.clone();
                let url = url.clone();
                let headers = headers.clone();
                tokio::spawn(async move {
                    this.get_playable_path_with_priority(&url, headers, true).await;
                });
            }
        }

        for offset in 1..=behind {
            if let Some(idx) = current_index.checked_sub(offset) {
                if let Some(url) = urls.get(idx) {
                    let this = self.clone();
                    let url = url.clone();
                    let headers = headers.clone();
                    tokio::spawn(async move {
                        this.get_playable_path_with_priority(&url, headers, false).await;
                    });
                }
            }
        }
    }

    /// Tears down any in-flight MP4 or HLS download for `url` and removes
    /// it from the queues.
    pub async fn cancel_download(&self, url: &str) {
        self.inner.downloader.cancel(url);
        self.inner.hls.cancel(url);
        let mut state = self.inner.state.lock().await;
        state.in_flight.remove(url);
        state.queued.remove(url);
        state.high.retain(|u| u != url);
        state.low.retain(|u| u != url);
    }

    /// Tears down every in-flight download and empties both queues.
    pub async fn cancel_all(&self) {
        self.inner.downloader.cancel_all();
        self.inner.hls.cancel_all();
        let mut state = self.inner.state.lock().await;
        *state = QueueState::default();
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.inner.metadata.is_complete(url)
    }

    pub fn get_progress(&self, url: &str) -> Option<ProgressRecord> {
        self.inner.metadata.get(url)
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        self.inner.network.set_class(network_type);
    }

    /// Tears down all download state. Intended for shutdown.
    pub async fn dispose(&self) {
        self.cancel_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::config::CacheConfig;

    #[test]
    fn hls_url_detection_covers_query_strings() {
        assert!(is_hls_url("https://h/live.m3u8"));
        assert!(is_hls_url("https://h/live.m3u8?token=abc"));
        assert!(is_hls_url("HTTPS://H/LIVE.M3U8"));
        assert!(!is_hls_url("https://h/video.mp4"));
    }

    fn build_controller(
        cache_root: std::path::PathBuf,
        configured_max_concurrent: usize,
    ) -> (ReelPrefetchController, Arc<CacheFileManager>, Arc<CacheMetadataStore>) {
        let file_manager = Arc::new(CacheFileManager::new(cache_root));
        let fm_for_probe = file_manager.clone();
        let metadata = Arc::new(CacheMetadataStore::new(
            file_manager.cache_dir().unwrap().to_path_buf(),
            move |url: &str| match fm_for_probe.exists(url) {
                Ok(true) => fm_for_probe.file_size(url).ok(),
                _ => None,
            },
        ));
        let downloader = ProgressiveDownloader::new(&CacheConfig::default()).unwrap();
        let hls = Arc::new(HlsCacheManager::new(downloader.clone(), file_manager.clone(), metadata.clone()));
        let network = Arc::new(NetworkQualityMonitor::new());
        let controller = ReelPrefetchController::new(
            downloader,
            hls,
            file_manager.clone(),
            metadata.clone(),
            network,
            configured_max_concurrent,
        );
        (controller, file_manager, metadata)
    }

    async fn spawn_mp4_server(body: Vec<u8>) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn already_complete_url_returns_cached_path_without_downloading() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, file_manager, metadata) = build_controller(tmp.path().to_path_buf(), 4);
        let url = "https://h/cached.mp4";
        let path = file_manager.ensure_file(url).unwrap();
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        metadata.mark_complete(url);

        let result = controller.get_playable_path(url, None).await;

        assert_eq!(result, path.to_string_lossy());
        let state = controller.inner.state.lock().await;
        assert!(state.in_flight.is_empty());
    }

    #[tokio::test]
    async fn mp4_below_threshold_downloads_synchronously_and_marks_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, file_manager, metadata) = build_controller(tmp.path().to_path_buf(), 4);
        let body = vec![7u8; 4096];
        let (base, _server) = spawn_mp4_server(body.clone()).await;
        let url = format!("{base}/short.mp4");

        let path = controller.get_playable_path(&url, None).await;
        assert_eq!(path, file_manager.file_path(&url).unwrap().to_string_lossy());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(metadata.is_complete(&url));
        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, body);
    }

    #[tokio::test]
    async fn second_request_for_an_in_flight_url_does_not_duplicate_queue_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _file_manager, _metadata) = build_controller(tmp.path().to_path_buf(), 4);
        let url = "https://h/already-in-flight.mp4";
        {
            let mut state = controller.inner.state.lock().await;
            state.in_flight.insert(url.to_owned());
        }

        // A download already owns the slot for this URL, so the second
        // caller's attempt to reserve a slot fails and its follow-up
        // enqueue is a no-op rather than adding a duplicate queue entry.
        let _ = controller.get_playable_path(url, None).await;

        let state = controller.inner.state.lock().await;
        assert_eq!(state.in_flight.len(), 1);
        assert!(state.queued.is_empty());
        assert!(state.high.is_empty());
    }

    #[tokio::test]
    async fn on_scroll_update_cancels_urls_that_left_the_keep_range() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _file_manager, _metadata) = build_controller(tmp.path().to_path_buf(), 4);
        let urls: Vec<String> = (0..4).map(|i| format!("https://h/{i}.mp4")).collect();
        {
            let mut state = controller.inner.state.lock().await;
            state.in_flight.insert(urls[0].clone());
        }

        controller
            .on_scroll_update(&urls, 3, Some(0), Some(0), Some(0), None)
            .await;

        let state = controller.inner.state.lock().await;
        assert!(!state.in_flight.contains(&urls[0]));
    }

    #[tokio::test]
    async fn on_scroll_update_enqueues_ahead_and_behind_when_no_slots_available() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _file_manager, _metadata) = build_controller(tmp.path().to_path_buf(), 0);
        let urls: Vec<String> = (0..3).map(|i| format!("https://h/{i}.mp4")).collect();

        controller
            .on_scroll_update(&urls, 1, Some(1), Some(1), Some(2), None)
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = controller.inner.state.lock().await;
        assert!(state.high.contains(&urls[2]), "ahead url should be high priority");
        assert!(state.low.contains(&urls[0]), "behind url should be low priority");
    }

    #[tokio::test]
    async fn cancel_download_removes_url_from_every_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _file_manager, _metadata) = build_controller(tmp.path().to_path_buf(), 4);
        let url = "https://h/queued.mp4";
        {
            let mut state = controller.inner.state.lock().await;
            state.queued.insert(url.to_owned());
            state.high.push_back(url.to_owned());
        }

        controller.cancel_download(url).await;

        let state = controller.inner.state.lock().await;
        assert!(!state.queued.contains(url));
        assert!(!state.high.contains(&url.to_owned()));
    }

    #[tokio::test]
    async fn cancel_all_empties_every_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _file_manager, _metadata) = build_controller(tmp.path().to_path_buf(), 4);
        {
            let mut state = controller.inner.state.lock().await;
            state.in_flight.insert("https://h/a.mp4".to_owned());
            state.queued.insert("https://h/b.mp4".to_owned());
            state.low.push_back("https://h/b.mp4".to_owned());
        }

        controller.cancel_all().await;

        let state = controller.inner.state.lock().await;
        assert!(state.in_flight.is_empty());
        assert!(state.queued.is_empty());
        assert!(state.low.is_empty());
    }
}
