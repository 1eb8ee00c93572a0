//! TTL sweeper.
//!
//! A dedicated worker that turns expired time-table entries into replicated
//! `delete` transactions. The sweeper never deletes directly: batches are
//! submitted through the replicator so expiry produces exactly the same
//! effects on every node as an explicit delete. Entries stay in the time
//! table until the deletion applies, so a failed submission is retried on
//! the next cycle.

use crate::metrics::MetricsRegistry;
use crate::replicator::Replicator;
use crate::store::Store;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fallback wait when the time table is empty.
pub const SWEEP_CEILING: Duration = Duration::from_millis(100);

/// Spawns the sweeper task.
///
/// The worker sleeps until the earliest time-table deadline (or `ceiling`
/// when there is none, or when the deadline has already passed and the last
/// submission is still pending), and is woken early by store writes and by
/// shutdown.
pub fn spawn_sweeper(
    store: Arc<Store>,
    replicator: Arc<dyn Replicator>,
    ceiling: Duration,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<MetricsRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = SystemTime::now();
            let sleep_for = match store.next_deadline() {
                Some(deadline) => deadline.duration_since(now).unwrap_or(ceiling),
                None => ceiling,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = store.wake().notified() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Some(batch) = store.expired_deletes(SystemTime::now()) {
                let count = batch.as_array().map(Vec::len).unwrap_or(0) as u64;
                match replicator.write(&batch).await {
                    Ok(_) => {
                        debug!(count, "swept expired TTL entries");
                        metrics.record_ttl_expired(count);
                    }
                    Err(e) => {
                        warn!(error = %e, "TTL sweep submission failed, retrying next cycle");
                    }
                }
            }
        }
        debug!("TTL sweeper stopped");
    })
}
