//! Periodic release of locks left behind by crashed workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;

/// Spawn a background task that releases locks older than `older_than`
/// every `interval` until `cancel` fires. The first sweep runs immediately.
pub fn spawn_lock_recovery(
    queue: Arc<JobQueue>,
    interval: Duration,
    older_than: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = older_than.as_secs(),
            "Lock recovery started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match queue.release_stale_locks(older_than).await {
                Ok(0) => tracing::debug!("No stale locks"),
                Ok(released) => tracing::info!(released, "Released stale job locks"),
                Err(e) => tracing::warn!("Lock recovery sweep failed: {}", e),
            }
        }

        tracing::debug!("Lock recovery stopped");
    })
}
