//! Background eviction of idle refresh state
//!
//! Per-key state is created lazily on the first refresh of a key and would
//! otherwise live for the whole process. A periodic task drops keys that have
//! nothing in flight and whose cooldown has passed.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::coordinator::RefreshCoordinator;

/// Spawn a background task that evicts idle refresh state every `interval`.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_eviction_task(
    coordinator: Arc<RefreshCoordinator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, nothing has been refreshed yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = coordinator.evict_idle();
            if evicted > 0 {
                debug!(
                    evicted,
                    remaining = coordinator.tracked_keys(),
                    "evicted idle refresh state"
                );
            }
        }
    })
}
