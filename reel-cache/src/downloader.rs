//! Pooled, resumable HTTP downloader that streams bytes into a growing file
//! and publishes progress as a pull-based event sequence.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use rustls::ClientConfig;
use rustls::crypto::aws_lc_rs;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;

const EMIT_THRESHOLD_BYTES: u64 = 64 * 1024;
const DEFAULT_MIN_BYTES: u64 = 128 * 1024;

/// One progress update from an in-flight download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub is_complete: bool,
}

/// A pull-based handle over a single download's progress events. Dropping
/// it does not cancel the download; call `ProgressiveDownloader::cancel`
/// for that.
pub struct DownloadProgressStream {
    rx: tokio::sync::mpsc::Receiver<Result<DownloadProgress, CacheError>>,
}

impl DownloadProgressStream {
    pub async fn next(&mut self) -> Option<Result<DownloadProgress, CacheError>> {
        self.rx.recv().await
    }
}

/// Resolved once either the byte threshold is crossed or the download
/// finishes (successfully or not) before reaching it. `progress` continues
/// to deliver events for the remainder of the download after resolution.
pub struct ThresholdHandle {
    ready: tokio::sync::oneshot::Receiver<Result<(), CacheError>>,
    pub progress: DownloadProgressStream,
}

impl ThresholdHandle {
    /// Awaits threshold resolution and returns it alongside the still-live
    /// progress stream, so the caller can keep consuming events afterward.
    pub async fn wait(self) -> (Result<(), CacheError>, DownloadProgressStream) {
        let result = match self.ready.await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Internal {
                reason: "download task dropped before reaching threshold".into(),
            }),
        };
        (result, self.progress)
    }

    /// Like `wait`, but gives up after `timeout` instead of waiting
    /// indefinitely. The progress stream is still returned on timeout so
    /// the caller can keep consuming events from the download that
    /// continues in the background.
    pub async fn wait_with_timeout(
        self,
        timeout: Duration,
    ) -> (Result<(), CacheError>, DownloadProgressStream) {
        let result = match tokio::time::timeout(timeout, self.ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CacheError::Internal {
                reason: "download task dropped before reaching threshold".into(),
            }),
            Err(_) => Err(CacheError::Timeout {
                reason: "threshold wait timed out".into(),
            }),
        };
        (result, self.progress)
    }
}

fn build_client(config: &CacheConfig) -> Result<Client, CacheError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CacheError::Configuration {
            reason: format!("failed to configure TLS protocol versions: {e}"),
        })?
        .with_platform_verifier()
        .map_err(|e| CacheError::Configuration {
            reason: format!("failed to configure platform certificate verifier: {e}"),
        })?
        .with_no_client_auth();

    Client::builder()
        .pool_max_idle_per_host(1)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.idle_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(CacheError::from)
}

struct ClientPool {
    clients: Vec<Client>,
    cursor: AtomicUsize,
}

impl ClientPool {
    fn next(&self) -> &Client {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[index]
    }
}

/// Fetches bytes into a growing file on disk, one in-flight download per
/// URL at a time. Cloning shares the connection pool and in-flight table.
#[derive(Clone)]
pub struct ProgressiveDownloader {
    pool: Arc<ClientPool>,
    in_flight: Arc<Mutex<std::collections::HashMap<String, CancellationToken>>>,
}

impl ProgressiveDownloader {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let mut clients = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            clients.push(build_client(config)?);
        }
        Ok(Self {
            pool: Arc::new(ClientPool {
                clients,
                cursor: AtomicUsize::new(0),
            }),
            in_flight: Arc::new(Mutex::new(std::collections::HashMap::new())),
        })
    }

    /// Starts (or restarts) a download for `url`. A prior in-flight
    /// download for the same URL is cancelled first. Returns immediately;
    /// the returned stream is driven by polling `next()`.
    pub fn download(
        &self,
        url: &str,
        file_path: PathBuf,
        start_byte: u64,
        headers: Option<HeaderMap>,
    ) -> DownloadProgressStream {
        let token = {
            let mut in_flight = self.in_flight.lock();
            if let Some(prev) = in_flight.remove(url) {
                prev.cancel();
            }
            let token = CancellationToken::new();
            in_flight.insert(url.to_owned(), token.clone());
            token
        };

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        let client = self.pool.next().clone();
        let url = url.to_owned();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            run_download(client, url.clone(), file_path, start_byte, headers, token, tx).await;
            in_flight.lock().remove(&url);
        });

        DownloadProgressStream { rx }
    }

    /// Starts a background download and returns a handle resolved once
    /// `downloaded_bytes >= min_bytes` or the download finishes.
    pub fn download_and_wait_for_bytes(
        &self,
        url: &str,
        file_path: PathBuf,
        start_byte: u64,
        min_bytes: u64,
        headers: Option<HeaderMap>,
    ) -> ThresholdHandle {
        let mut inner = self.download(url, file_path, start_byte, headers);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let (out_tx, out_rx) = tokio::sync::mpsc::channel(32);

        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            while let Some(item) = inner.next().await {
                match item {
                    Ok(progress) => {
                        let crossed = progress.downloaded_bytes >= min_bytes || progress.is_complete;
                        if crossed {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        if out_tx.send(Ok(progress)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(e));
                        } else {
                            let _ = out_tx.send(Err(e)).await;
                        }
                        break;
                    }
                }
            }
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Ok(()));
            }
        });

        ThresholdHandle {
            ready: ready_rx,
            progress: DownloadProgressStream { rx: out_rx },
        }
    }

    /// Cancels the in-flight download for `url`, if any.
    pub fn cancel(&self, url: &str) {
        if let Some(token) = self.in_flight.lock().remove(url) {
            token.cancel();
        }
    }

    /// Cancels every in-flight download.
    pub fn cancel_all(&self) {
        let mut in_flight = self.in_flight.lock();
        for (_, token) in in_flight.drain() {
            token.cancel();
        }
    }

    pub fn default_min_bytes() -> u64 {
        DEFAULT_MIN_BYTES
    }

    /// One-shot GET of a small text body (playlists). Not subject to the
    /// in-flight/resume machinery `download` provides.
    pub async fn fetch_text(&self, url: &str) -> Result<String, CacheError> {
        let client = self.pool.next().clone();
        let response = client.get(url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(CacheError::http_status(status, url.to_owned()));
        }
        response.text().await.map_err(CacheError::from)
    }

    /// One-shot GET of a complete small file (HLS segments), written in one
    /// pass rather than streamed and resumed.
    pub async fn fetch_to_file(&self, url: &str, path: &std::path::Path) -> Result<(), CacheError> {
        let client = self.pool.next().clone();
        let response = client.get(url).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(CacheError::http_status(status, url.to_owned()));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(path, &bytes).await.map_err(CacheError::from)
    }
}

/// The subset of `ProgressiveDownloader` that `HlsCacheManager` depends on:
/// fetching a playlist body and fetching one segment to a file. Narrowing
/// the dependency to a trait lets HLS cache-manager tests substitute a
/// `MockPlaylistFetcher` instead of a live network.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PlaylistFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, CacheError>;
    async fn fetch_to_file(&self, url: &str, path: &std::path::Path) -> Result<(), CacheError>;
}

#[async_trait::async_trait]
impl PlaylistFetcher for ProgressiveDownloader {
    async fn fetch_text(&self, url: &str) -> Result<String, CacheError> {
        ProgressiveDownloader::fetch_text(self, url).await
    }

    async fn fetch_to_file(&self, url: &str, path: &std::path::Path) -> Result<(), CacheError> {
        ProgressiveDownloader::fetch_to_file(self, url, path).await
    }
}

async fn run_download(
    client: Client,
    url: String,
    file_path: PathBuf,
    start_byte: u64,
    headers: Option<HeaderMap>,
    token: CancellationToken,
    tx: tokio::sync::mpsc::Sender<Result<DownloadProgress, CacheError>>,
) {
    let mut start = start_byte;

    // Loop at most twice: once for the initial request, once more if the
    // server ignored our range and we must truncate and restart from zero.
    let (mut body_stream, total_bytes) = loop {
        let mut request = client.get(&url);
        if let Some(h) = &headers {
            request = request.headers(h.clone());
        }
        if start > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={start}-"));
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(CacheError::from(e))).await;
                return;
            }
        };

        let status = response.status();
        if status == StatusCode::OK && start > 0 {
            debug!(url, "server ignored range request, truncating and restarting");
            // Drain and discard; the server is sending the full body from
            // byte zero, which would otherwise corrupt the partial file.
            let _ = response.bytes().await;
            if let Err(e) = truncate_file(&file_path).await {
                let _ = tx.send(Err(e)).await;
                return;
            }
            start = 0;
            continue;
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            let _ = tx.send(Err(CacheError::http_status(status, url.clone()))).await;
            return;
        }

        let total_bytes = response
            .content_length()
            .filter(|&len| len > 0)
            .map(|len| start + len);
        break (response.bytes_stream(), total_bytes);
    };

    let file = match tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(start == 0)
        .append(start > 0)
        .open(&file_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            let _ = tx.send(Err(CacheError::from(e))).await;
            return;
        }
    };
    let mut file = tokio::io::BufWriter::new(file);

    let mut downloaded = start;
    let mut last_emitted = start;

    use futures::StreamExt;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                // Partial bytes are retained on disk for future resume; no
                // final event is emitted for a cancelled download. Flush
                // the buffered writer so bytes already read from the
                // socket actually land on disk before we drop the file.
                let _ = file.flush().await;
                return;
            }
            chunk = body_stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = file.write_all(&bytes).await {
                            let _ = tx.send(Err(CacheError::from(e))).await;
                            return;
                        }
                        downloaded += bytes.len() as u64;
                        if downloaded - last_emitted >= EMIT_THRESHOLD_BYTES {
                            last_emitted = downloaded;
                            if tx
                                .send(Ok(DownloadProgress {
                                    downloaded_bytes: downloaded,
                                    total_bytes,
                                    is_complete: false,
                                }))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(CacheError::from(e))).await;
                        return;
                    }
                    None => {
                        if let Err(e) = file.flush().await {
                            let _ = tx.send(Err(CacheError::from(e))).await;
                            return;
                        }
                        let _ = tx
                            .send(Ok(DownloadProgress {
                                downloaded_bytes: downloaded,
                                total_bytes,
                                is_complete: true,
                            }))
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

async fn truncate_file(path: &std::path::Path) -> Result<(), CacheError> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map(|_| ())
        .map_err(CacheError::from)
}
