//! Cache Maintenance Task
//!
//! Periodically drops entries nobody has looked at within the TTL, trims the
//! cache back under its entry cap and forgets old delete tombstones and
//! placeholder aliases.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::SyncClient;

/// Spawns the maintenance loop.
///
/// Entries with subscribers or unconfirmed writes survive every pass.
/// Abort the returned handle during shutdown.
pub fn spawn_cleanup_task(client: Arc<SyncClient>, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs);

    tokio::spawn(async move {
        info!(
            "Starting cache maintenance task with interval of {} seconds",
            cleanup_interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            let report = client.run_maintenance();
            if report.total() > 0 {
                info!(
                    expired = report.expired,
                    evicted = report.evicted,
                    tombstones = report.tombstones,
                    aliases = report.aliases,
                    remaining = client.memory().cache_size(),
                    "cache maintenance"
                );
            } else {
                debug!("cache maintenance: nothing to remove");
            }
        }
    })
}
