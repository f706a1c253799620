use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::dir_cache::DirectoryCache;
use super::download::DownloadCoordinator;

/// Start a background thread that periodically drops expired listings and
/// download links.
pub fn start_sweeper_thread(
    dir_cache: Arc<DirectoryCache>,
    downloads: Arc<DownloadCoordinator>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("panfs-sweeper".to_string())
        .spawn(move || {
            debug!("Sweeper thread started, interval={:?}", interval);
            while !shutdown.load(Ordering::Relaxed) {
                // 1-second ticks keep shutdown latency low.
                let mut remaining = interval;
                let tick = Duration::from_secs(1);
                while remaining > Duration::ZERO {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let sleep_time = remaining.min(tick);
                    std::thread::sleep(sleep_time);
                    remaining = remaining.saturating_sub(sleep_time);
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                sweep(&dir_cache, &downloads);
            }
            debug!("Sweeper thread shutting down");
        })
}

/// One sweep pass. Returns `(listings, links)` evicted.
pub fn sweep(dir_cache: &DirectoryCache, downloads: &DownloadCoordinator) -> (usize, usize) {
    let listings = dir_cache.evict_expired();
    let links = downloads.evict_stale_links();
    if listings + links > 0 {
        debug!("swept {} listings, {} download links", listings, links);
    }
    (listings, links)
}
