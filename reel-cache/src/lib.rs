pub mod config;
pub mod downloader;
pub mod error;
pub mod evictor;
pub mod file_manager;
pub mod hash;
pub mod hls;
pub mod metadata;
pub mod network;
pub mod prefetch;

pub use config::CacheConfig;
pub use downloader::{DownloadProgress, DownloadProgressStream, ProgressiveDownloader, ThresholdHandle};
pub use error::CacheError;
pub use evictor::Evictor;
pub use file_manager::{CacheEntry, CacheFileManager, EntryKind};
pub use hash::CacheKey;
pub use hls::{HlsCacheManager, PlayableHls};
pub use metadata::{CacheMetadataStore, ProgressRecord};
pub use network::{Connectivity, NetworkQualityMonitor, NetworkType, PrefetchConfig};
pub use prefetch::ReelPrefetchController;

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::header::HeaderMap;

/// Wires every component together against a single on-disk cache root.
/// This is the entry point most embedders should use; the individual
/// modules remain public for callers who want to assemble a custom
/// pipeline (e.g. a downloader without the HLS or eviction machinery).
pub struct ReelCache {
    config: CacheConfig,
    file_manager: Arc<CacheFileManager>,
    metadata: Arc<CacheMetadataStore>,
    evictor: Arc<Evictor>,
    network: Arc<NetworkQualityMonitor>,
    prefetch: ReelPrefetchController,
}

impl ReelCache {
    /// Builds every component rooted at `cache_root/video_cache`.
    pub fn new(cache_root: PathBuf, config: CacheConfig) -> Result<Self, CacheError> {
        let file_manager = Arc::new(CacheFileManager::new(cache_root));

        let fm_for_probe = file_manager.clone();
        let metadata = Arc::new(CacheMetadataStore::new(
            file_manager.cache_dir()?.to_path_buf(),
            move |url: &str| match fm_for_probe.exists(url) {
                Ok(true) => fm_for_probe.file_size(url).ok(),
                _ => None,
            },
        ));

        let downloader = ProgressiveDownloader::new(&config)?;
        let hls = Arc::new(HlsCacheManager::new(
            downloader.clone(),
            file_manager.clone(),
            metadata.clone(),
        ));
        let evictor = Arc::new(Evictor::new(
            file_manager.clone(),
            metadata.clone(),
            config.max_cache_bytes,
        ));
        let network = Arc::new(NetworkQualityMonitor::new());
        let prefetch = ReelPrefetchController::new(
            downloader,
            hls,
            file_manager.clone(),
            metadata.clone(),
            network.clone(),
            config.pool_size,
        );

        Ok(Self {
            config,
            file_manager,
            metadata,
            evictor,
            network,
            prefetch,
        })
    }

    pub fn with_default_config(cache_root: PathBuf) -> Result<Self, CacheError> {
        Self::new(cache_root, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get_playable_path(&self, url: &str, headers: Option<HeaderMap>) -> String {
        self.prefetch.get_playable_path(url, headers).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn on_scroll_update(
        &self,
        urls: &[String],
        current_index: usize,
        prefetch_count: Option<usize>,
        prefetch_behind: Option<usize>,
        keep_range: Option<usize>,
        headers: Option<HeaderMap>,
    ) {
        self.prefetch
            .on_scroll_update(urls, current_index, prefetch_count, prefetch_behind, keep_range, headers)
            .await;
    }

    pub async fn cancel_download(&self, url: &str) {
        self.prefetch.cancel_download(url).await;
    }

    pub async fn cancel_all(&self) {
        self.prefetch.cancel_all().await;
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.prefetch.is_cached(url)
    }

    pub fn get_progress(&self, url: &str) -> Option<ProgressRecord> {
        self.prefetch.get_progress(url)
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        self.prefetch.set_network_type(network_type);
    }

    pub async fn dispose(&self) {
        self.prefetch.dispose().await;
    }

    pub fn evict_if_needed(&self) -> Result<usize, CacheError> {
        self.evictor.evict_if_needed()
    }

    pub fn evict_if_needed_throttled(&self) -> Result<usize, CacheError> {
        self.evictor.evict_if_needed_throttled()
    }

    /// Wipes the cache directory and the metadata store.
    pub fn clear_all(&self) -> Result<(), CacheError> {
        self.file_manager.clear_all()?;
        self.metadata.clear_all();
        Ok(())
    }

    pub fn network_monitor(&self) -> &NetworkQualityMonitor {
        &self.network
    }
}
