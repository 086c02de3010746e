//! Maintenance loop: a single long-running task that periodically flushes
//! dirty records and evicts stale ones.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::registry::Registry;
use crate::session::unix_now_secs;

/// Run the maintenance loop until `shutdown` resolves. Wakes every
/// `save_interval_secs`; runs the eviction sweep at most once per
/// `cleanup_interval_secs`.
pub async fn run(registry: Arc<Registry>, config: Config, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.save_interval_secs.max(1)));
    let mut last_cleanup = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&registry, &config, &mut last_cleanup);
            }
            _ = &mut shutdown => {
                info!("maintenance loop shutting down");
                break;
            }
        }
    }
}

fn tick(registry: &Registry, config: &Config, last_cleanup: &mut u64) {
    let (flushed, failed) = registry.save_all(config.save_interval_secs);

    let now = unix_now_secs();
    let mut evicted = 0;
    if now.saturating_sub(*last_cleanup) >= config.cleanup_interval_secs {
        evicted = registry.evict(config.max_inactive_age_secs, config.soft_session_cap);
        *last_cleanup = now;
    }

    info!(
        flushed,
        failed,
        evicted,
        active = registry.active_count(),
        total = registry.count(),
        "maintenance tick"
    );
}
