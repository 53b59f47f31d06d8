//! Background maintenance sweep over the VM pool.

use std::sync::Arc;

use appforge_config::PoolConfig;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::lease::LeaseManager;

/// Timer-driven prune loop.
///
/// Runs independently of claim and release. Storage errors are logged and
/// retried on the next sweep, never surfaced to request-path callers.
pub struct PruneSweeper {
    lease: Arc<LeaseManager>,
    config: PoolConfig,
}

impl PruneSweeper {
    pub fn new(lease: Arc<LeaseManager>, config: PoolConfig) -> Self {
        Self { lease, config }
    }

    /// Run the sweep loop forever.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.prune_interval_secs,
            heartbeat_ttl_secs = self.config.heartbeat_ttl_secs,
            "starting prune sweeper"
        );

        loop {
            sleep(self.config.prune_interval()).await;

            match self.lease.prune().await {
                Ok(pruned) if !pruned.is_empty() => {
                    info!(count = pruned.len(), "prune sweep reclaimed stale vms");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "prune sweep failed, will retry next interval");
                }
            }

            if self.config.reclaim_expired_leases {
                match self.lease.reclaim_expired().await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "reclaimed expired leases");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "lease reclaim failed, will retry next interval");
                    }
                }
            }
        }
    }
}
