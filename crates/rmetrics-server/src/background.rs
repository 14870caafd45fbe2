//! Background processing: periodic snapshot flush.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info};

use rmetrics_core::storage::MetricStorage;

/// Flushes `storage` every `interval` until `shutdown` flips to true.
///
/// The final snapshot on shutdown is written by the caller, after the
/// server has stopped taking updates.
pub(crate) async fn snapshot_loop(
    storage: Arc<dyn MetricStorage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing to save yet.
    tick.tick().await;
    let mut flush_count: u64 = 0;

    info!(interval_secs = interval.as_secs(), "snapshot loop started");
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let storage = storage.clone();
        let t0 = Instant::now();
        let result = tokio::task::spawn_blocking(move || storage.flush()).await;
        let duration_ms = t0.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(())) => {
                flush_count += 1;
                debug!(duration_ms, flush_count, "periodic snapshot written");
            }
            Ok(Err(e)) => error!(error = %e, duration_ms, "periodic snapshot failed"),
            Err(e) => error!(error = %e, "snapshot task panicked in spawn_blocking"),
        }
    }
    info!(flush_count, "snapshot loop stopped");
}
