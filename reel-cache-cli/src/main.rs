//! Thin driver for `reel-cache`: resolves a playable local path for one URL
//! and reports progress until the download completes, mirroring the
//! `siphon`/`mesio` CLIs' `clap` + `tracing_subscriber` wiring.

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use reel_cache::{CacheConfig, ReelCache};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Fetch a single MP4 or HLS URL through the progressive video cache and
/// print progress until it finishes (or is already complete).
#[derive(Parser, Debug)]
#[command(name = "reel-cache-cli", version, about)]
struct CliArgs {
    /// Remote MP4 or HLS (.m3u8) URL to cache.
    url: String,

    /// Cache root directory; defaults to the OS temp directory, matching
    /// `CacheFileManager::cache_dir`'s `<os_tmp>/video_cache` layout.
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Maximum cache size in bytes before eviction kicks in.
    #[arg(long, default_value_t = CacheConfig::default().max_cache_bytes)]
    max_cache_bytes: u64,

    /// How often to poll and print progress while the download is active.
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Run a throttled eviction pass before exiting.
    #[arg(long)]
    evict: bool,

    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    info!("reel-cache-cli: progressive video cache demo driver");

    let cache_root = args.cache_root.unwrap_or_else(std::env::temp_dir);
    let config = CacheConfig {
        max_cache_bytes: args.max_cache_bytes,
        ..CacheConfig::default()
    };

    let cache = match ReelCache::new(cache_root, config) {
        Ok(cache) => cache,
        Err(e) => {
            error!("failed to initialize cache: {e}");
            exit(1);
        }
    };

    let path = cache.get_playable_path(&args.url, None).await;
    info!(url = %args.url, path = %path, "resolved playable path");

    let poll_interval = Duration::from_millis(args.poll_interval_ms);
    loop {
        match cache.get_progress(&args.url) {
            Some(progress) => {
                info!(
                    downloaded = progress.downloaded_bytes,
                    total = ?progress.total_bytes,
                    complete = progress.is_complete,
                    "progress"
                );
                if progress.is_complete {
                    break;
                }
            }
            None => {
                info!("no progress record yet (URL may be streaming directly via fallback)");
                break;
            }
        }
        tokio::time::sleep(poll_interval).await;
    }

    if args.evict {
        match cache.evict_if_needed_throttled() {
            Ok(deleted) => info!(deleted, "eviction pass complete"),
            Err(e) => error!("eviction failed: {e}"),
        }
    }

    cache.dispose().await;
}
