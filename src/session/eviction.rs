//! Idle session eviction.
//!
//! Runs as a background task closing sessions that have no live
//! subscriber, no turn in flight and no activity for longer than the idle
//! timeout. Sessions orphaned by a dropped channel end up here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SessionRegistry;

/// Spawn the idle eviction background task.
#[must_use]
pub fn spawn_eviction_task(
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("eviction task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = evict_idle(&registry, idle_timeout).await;
                    if evicted > 0 {
                        info!(evicted, "idle sessions evicted");
                    }
                }
            }
        }
    })
}

/// Close every idle, unattached session once. Returns the number closed.
pub async fn evict_idle(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
    let Ok(idle) = chrono::Duration::from_std(idle_timeout) else {
        return 0;
    };
    let cutoff = Utc::now() - idle;
    let mut evicted = 0;
    for slot in registry.slots() {
        let mut entry = slot.state.lock().await;
        if entry.is_closed()
            || entry.turn_running
            || entry.stream.has_subscriber()
            || entry.session.updated_at > cutoff
        {
            continue;
        }
        debug!(session_id = %slot.id, updated_at = %entry.session.updated_at, "evicting idle session");
        registry.retire(&slot, &mut entry, "idle timeout");
        evicted += 1;
    }
    evicted
}
