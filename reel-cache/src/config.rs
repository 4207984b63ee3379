//! Ambient configuration shared by the downloader and HLS cache manager.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Configuration for the HTTP layer shared by the progressive downloader and
/// the HLS cache manager.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of long-lived clients in the round-robin connection pool.
    pub pool_size: usize,
    /// Connect timeout per request.
    pub connect_timeout: Duration,
    /// Idle timeout before a pooled connection is recycled.
    pub idle_timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Default headers merged into every request (caller-supplied headers
    /// on a specific call take precedence).
    pub headers: HeaderMap,
    /// Byte threshold `download_and_wait_for_bytes` waits for by default.
    pub min_playable_bytes: u64,
    /// Maximum total cache size before eviction runs, in bytes.
    pub max_cache_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            connect_timeout: Duration::from_secs(8),
            idle_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: Self::default_headers(),
            min_playable_bytes: 128 * 1024,
            max_cache_bytes: 200 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers
    }
}
