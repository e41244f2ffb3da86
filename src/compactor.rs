use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a business's WAL once enough appends have
/// piled up since the last compaction. Exits when the engine is dropped.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        compact_if_due(&engine, threshold).await;
    }
}

/// Compact when the append count reaches `threshold`. Returns whether a
/// compaction ran.
pub async fn compact_if_due(engine: &Arc<Engine>, threshold: u64) -> bool {
    let appends = match engine.appends_since_compact().await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("compactor: {e}");
            return false;
        }
    };
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            tracing::info!("compacted wal after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("wal compaction failed: {e}");
            false
        }
    }
}
