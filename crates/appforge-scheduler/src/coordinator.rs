//! Orchestration coordinator.
//!
//! Reacts to build status changes: success promotes the project's chain head
//! and claims a VM on its behalf; failure freezes the chain until an external
//! retry clears it. Status changes arrive either through `report_status` or
//! as events on an mpsc channel, never by polling.

use std::sync::Arc;

use appforge_config::{CoordinatorConfig, SystemConfig};
use appforge_core::build::{Attachment, Build, BuildStatus};
use appforge_core::{Error, ProjectId, ResourceId, Result};
use appforge_registry::{MemBuildStore, MemVmStore};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::chain::ChainManager;
use crate::lease::LeaseManager;

/// Event emitted when a build's status changes.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    StatusChanged {
        build_id: ResourceId,
        status: BuildStatus,
        error_code: Option<String>,
    },
}

/// Wires the chain manager and lease manager together.
#[derive(Clone)]
pub struct Coordinator {
    chain: Arc<ChainManager>,
    lease: Arc<LeaseManager>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        chain: Arc<ChainManager>,
        lease: Arc<LeaseManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            chain,
            lease,
            config,
        }
    }

    /// Wire a coordinator over fresh in-memory stores.
    pub fn in_memory(config: SystemConfig) -> (Self, Arc<LeaseManager>, Arc<ChainManager>) {
        let lease = Arc::new(LeaseManager::new(Arc::new(MemVmStore::new()), config.pool));
        let chain = Arc::new(ChainManager::new(
            Arc::new(MemBuildStore::new()),
            config.chain,
        ));
        let coordinator = Coordinator::new(chain.clone(), lease.clone(), config.coordinator);
        (coordinator, lease, chain)
    }

    /// Spawn the event loop. Returns the sender side of the status channel
    /// and the loop's join handle; the loop ends when all senders drop.
    pub fn start(&self) -> (mpsc::Sender<BuildEvent>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(100);
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let BuildEvent::StatusChanged {
                    build_id,
                    status,
                    error_code,
                } = event;
                if let Err(e) = coordinator
                    .report_status(build_id, status, error_code)
                    .await
                {
                    error!(build_id = %build_id, error = %e, "failed to apply status change");
                }
            }
        });
        (tx, handle)
    }

    /// Submit a new build request: create the build (or stage it) and, when
    /// it starts immediately, claim a VM for it.
    pub async fn submit_message(
        &self,
        project_id: &ProjectId,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(Build, bool)> {
        let (build, staged) = self
            .chain
            .create_message(project_id, content, attachments)
            .await?;
        if !staged {
            self.claim_for_build(project_id.clone(), build.id).await;
        }
        Ok((build, staged))
    }

    /// Apply a reported build status and run its side effects.
    pub async fn report_status(
        &self,
        build_id: ResourceId,
        status: BuildStatus,
        error_code: Option<String>,
    ) -> Result<()> {
        match status {
            BuildStatus::Running => {
                if self.chain.record_running(build_id).await?.is_none() {
                    warn!(build_id = %build_id, "ignoring running report for non-queued build");
                }
                Ok(())
            }
            BuildStatus::Succeeded => {
                let Some(build) = self.chain.record_succeeded(build_id).await? else {
                    warn!(build_id = %build_id, "ignoring stale success report");
                    return Ok(());
                };
                self.promote_and_claim(&build.project_id).await
            }
            BuildStatus::Failed => {
                if self
                    .chain
                    .record_failed(build_id, error_code)
                    .await?
                    .is_none()
                {
                    warn!(build_id = %build_id, "ignoring stale failure report");
                }
                // The chain stays frozen until retry_failed or deletion.
                Ok(())
            }
            BuildStatus::Pending | BuildStatus::Queued => Err(Error::Validation(format!(
                "status {status:?} cannot be reported"
            ))),
        }
    }

    /// Clear a failed build and put it back in the queue with a fresh VM
    /// claim. The external "retry" action.
    pub async fn retry_failed(&self, build_id: ResourceId) -> Result<Build> {
        let build = self.chain.clear_failure(build_id).await?;
        self.claim_for_build(build.project_id.clone(), build.id).await;
        Ok(build)
    }

    async fn promote_and_claim(&self, project_id: &ProjectId) -> Result<()> {
        let Some(promoted) = self.chain.promote_next(project_id).await? else {
            return Ok(());
        };
        self.claim_for_build(project_id.clone(), promoted.id).await;
        Ok(())
    }

    /// Claim a VM for a queued build. When the pool is exhausted the build
    /// stays queued and a background task retries on a backoff schedule.
    async fn claim_for_build(&self, project_id: ProjectId, build_id: ResourceId) {
        match self.lease.claim(&project_id, Some(build_id)).await {
            Ok(vm) => {
                info!(build_id = %build_id, vm_id = %vm.id, "assigned vm to build");
            }
            Err(Error::ResourceUnavailable(_)) => {
                warn!(
                    build_id = %build_id,
                    project_id = %project_id,
                    "no idle vms, scheduling claim retries"
                );
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.retry_claim(project_id, build_id).await;
                });
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "vm claim failed");
            }
        }
    }

    async fn retry_claim(&self, project_id: ProjectId, build_id: ResourceId) {
        let mut delay = self.config.claim_retry_initial();
        for attempt in 1..=self.config.claim_retry_attempts {
            tokio::time::sleep(delay).await;

            // The build may have been claimed elsewhere, deleted, or failed
            // in the meantime; only a still-queued build is worth a VM.
            match self.chain.build(build_id).await {
                Ok(Some(build)) if build.status == BuildStatus::Queued => {}
                Ok(_) => return,
                Err(e) => {
                    error!(build_id = %build_id, error = %e, "claim retry aborted");
                    return;
                }
            }

            match self.lease.claim(&project_id, Some(build_id)).await {
                Ok(vm) => {
                    info!(
                        build_id = %build_id,
                        vm_id = %vm.id,
                        attempt,
                        "assigned vm to build after retry"
                    );
                    return;
                }
                Err(Error::ResourceUnavailable(_)) => {
                    delay = (delay * 2).min(self.config.claim_retry_max());
                }
                Err(e) => {
                    error!(build_id = %build_id, error = %e, "vm claim failed");
                    return;
                }
            }
        }
        warn!(
            build_id = %build_id,
            attempts = self.config.claim_retry_attempts,
            "giving up on vm claim retries"
        );
    }
}
