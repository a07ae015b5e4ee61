//! Cache sweeper — drops expired result-cache entries on a fixed interval
//!
//! Expired entries are already invisible to readers; sweeping only returns
//! their memory and keeps `len()` honest between reads.

use std::sync::Arc;
use std::time::Duration;

use qclass_core::ResultCache;
use tokio::sync::broadcast;

/// One pass. Returns the number of entries removed.
pub fn sweep_once(cache: &ResultCache) -> usize {
    match cache.purge_expired() {
        Ok(0) => 0,
        Ok(n) => {
            tracing::debug!(purged = n, "Cache sweep removed expired entries");
            n
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cache sweep failed (non-fatal)");
            0
        }
    }
}

/// Called from main.rs; runs until the shutdown broadcast fires.
pub async fn run_cache_sweeper(
    cache: Arc<ResultCache>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Cache sweeper started (interval: {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&cache);
            }
            _ = shutdown.recv() => {
                tracing::info!("Cache sweeper shutting down");
                break;
            }
        }
    }
}
