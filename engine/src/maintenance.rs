//! Background refresh task.
//!
//! Keeps the published snapshot fresh between reads so that the first query
//! after a burst of writes does not pay for the rebuild itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::index::LearnedIndex;
use crate::store::BackingStore;

/// Spawn a task calling `ensure_fresh()` every `interval` until `shutdown`
/// fires or its sender is dropped.
pub fn spawn_background_refresh<S>(
    index: Arc<LearnedIndex<S>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    S: BackingStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "background refresh started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !index.is_dirty() {
                        continue;
                    }
                    let index = Arc::clone(&index);
                    // Rebuilds are CPU-bound; keep them off the async workers.
                    let outcome = tokio::task::spawn_blocking(move || index.ensure_fresh()).await;
                    match outcome {
                        Ok(Ok(rebuilt)) => debug!(rebuilt, "background refresh tick"),
                        Ok(Err(e)) => error!(error = %e, "background rebuild failed"),
                        Err(e) => error!(error = %e, "background rebuild task panicked"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("background refresh shutting down");
                    break;
                }
            }
        }
    })
}

/// Spawn the refresh task only when the index config enables it.
pub fn spawn_configured_refresh<S>(
    index: &Arc<LearnedIndex<S>>,
    shutdown: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>>
where
    S: BackingStore + 'static,
{
    let interval = index.config().refresh_interval()?;
    Some(spawn_background_refresh(Arc::clone(index), interval, shutdown))
}
