use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that drops waitlist entries for slots that have already started,
/// and forgets notify channels nobody listens to anymore.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.expire_waitlist().await {
            Ok(0) => {}
            Ok(n) => info!("reaped {n} waitlist entries for started slots"),
            Err(e) => warn!("waitlist reaper failed: {e}"),
        }
        let pruned = engine.notify().prune();
        if pruned > 0 {
            debug!("pruned {pruned} idle notify channels");
        }
    }
}

/// Background task that rewrites the WAL once enough commits have piled up since
/// the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(()) => info!(appends, revision = engine.revision(), "compacted WAL"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
