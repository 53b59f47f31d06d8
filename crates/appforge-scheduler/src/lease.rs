//! VM lease management.
//!
//! Claim, release, heartbeat, and prune are all conditional updates against
//! the registry; the manager never reads a status and writes back a decision
//! across separate store calls.

use std::sync::Arc;

use appforge_config::PoolConfig;
use appforge_core::store::VmStore;
use appforge_core::vm::{PoolStatus, RuntimeState, Vm, VmChange, VmStatus};
use appforge_core::{Error, ProjectId, ResourceId, Result};
use chrono::{Duration, Utc};
use tracing::{info, warn};

/// Manages leases over the VM pool.
pub struct LeaseManager {
    store: Arc<dyn VmStore>,
    config: PoolConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn VmStore>, config: PoolConfig) -> Self {
        Self { store, config }
    }

    /// Register a worker VM, or restore a known instance to the pool.
    ///
    /// Workers call this on boot. A previously pruned instance comes back
    /// idle with its lease fields cleared and a fresh heartbeat.
    pub async fn register(&self, instance_id: &str, base_url: &str) -> Result<Vm> {
        if self.store.get_by_instance(instance_id).await?.is_some() {
            let change = VmChange {
                status: Some(VmStatus::Idle),
                runtime_state: Some(RuntimeState::Serving),
                base_url: Some(base_url.to_string()),
                project_id: Some(None),
                desired_build_id: Some(None),
                lease_owner: Some(None),
                lease_expires_at: Some(None),
                last_heartbeat_at: Some(Utc::now()),
                ..Default::default()
            };
            let vm = self
                .store
                .update_instance(instance_id, change)
                .await?
                .ok_or_else(|| Error::Internal(format!("instance {instance_id} vanished")))?;
            info!(vm_id = %vm.id, instance_id, "re-registered vm");
            return Ok(vm);
        }

        let vm = self.store.insert(Vm::registered(instance_id, base_url)).await?;
        info!(vm_id = %vm.id, instance_id, "registered vm");
        Ok(vm)
    }

    /// Atomically claim one idle VM for a project.
    ///
    /// Scans idle candidates oldest-idle-first and attempts a compare-and-swap
    /// on each; losing a race on one candidate moves on to the next. Under N
    /// idle VMs and M >= N concurrent callers, exactly N claims succeed.
    pub async fn claim(
        &self,
        project_id: &ProjectId,
        desired_build_id: Option<ResourceId>,
    ) -> Result<Vm> {
        let mut candidates: Vec<Vm> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|vm| vm.status.is_leasable())
            .collect();
        candidates.sort_by_key(|vm| vm.updated_at);

        for candidate in candidates {
            let now = Utc::now();
            let change = VmChange {
                status: Some(VmStatus::Busy),
                runtime_state: Some(RuntimeState::Starting),
                project_id: Some(Some(project_id.clone())),
                desired_build_id: Some(desired_build_id),
                lease_owner: Some(Some(format!("project:{project_id}"))),
                lease_expires_at: Some(Some(
                    now + Duration::seconds(self.config.lease_ttl_secs as i64),
                )),
                // A fresh claim resets the heartbeat, so the prune sweep can
                // never pick up a VM claimed after its staleness window began.
                last_heartbeat_at: Some(now),
                ..Default::default()
            };
            if let Some(vm) = self
                .store
                .update_where(candidate.id, &[VmStatus::Idle], change)
                .await?
            {
                info!(
                    vm_id = %vm.id,
                    instance_id = %vm.instance_id,
                    project_id = %project_id,
                    "claimed vm"
                );
                return Ok(vm);
            }
            // Lost the race on this candidate; try the next one.
        }

        Err(Error::ResourceUnavailable("no_idle_vms".to_string()))
    }

    /// Release a VM back to the pool. Idempotent: releasing an already idle
    /// or unknown instance is a no-op.
    pub async fn release(&self, instance_id: &str) -> Result<()> {
        let change = VmChange {
            status: Some(VmStatus::Idle),
            runtime_state: Some(RuntimeState::Serving),
            project_id: Some(None),
            desired_build_id: Some(None),
            lease_owner: Some(None),
            lease_expires_at: Some(None),
            last_shutdown_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Some(vm) = self.store.update_instance(instance_id, change).await? {
            info!(vm_id = %vm.id, instance_id, "released vm");
        }
        Ok(())
    }

    /// Record a worker heartbeat. Does not change status.
    pub async fn heartbeat(&self, instance_id: &str) -> Result<Vm> {
        let change = VmChange {
            last_heartbeat_at: Some(Utc::now()),
            ..Default::default()
        };
        self.store
            .update_instance(instance_id, change)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unknown instance {instance_id}")))
    }

    /// One prune sweep: every idle, busy, or starting VM whose heartbeat is
    /// older than the heartbeat TTL goes to error with its lease cleared.
    pub async fn prune(&self) -> Result<Vec<Vm>> {
        let cutoff = Utc::now() - Duration::seconds(self.config.heartbeat_ttl_secs as i64);
        let change = VmChange {
            status: Some(VmStatus::Error),
            runtime_state: Some(RuntimeState::Error),
            project_id: Some(None),
            desired_build_id: Some(None),
            lease_owner: Some(None),
            lease_expires_at: Some(None),
            last_shutdown_at: Some(Utc::now()),
            ..Default::default()
        };
        let pruned = self
            .store
            .sweep_where(VmStatus::prunable(), cutoff, change)
            .await?;
        for vm in &pruned {
            warn!(
                vm_id = %vm.id,
                instance_id = %vm.instance_id,
                last_heartbeat_at = %vm.last_heartbeat_at,
                "pruned stale vm"
            );
        }
        Ok(pruned)
    }

    /// Reclaim leases that outlived the lease TTL. Safety net for leases the
    /// owner never released; disabled unless configured on.
    pub async fn reclaim_expired(&self) -> Result<Vec<Vm>> {
        let change = VmChange {
            status: Some(VmStatus::Idle),
            runtime_state: Some(RuntimeState::Serving),
            project_id: Some(None),
            desired_build_id: Some(None),
            lease_owner: Some(None),
            lease_expires_at: Some(None),
            last_shutdown_at: Some(Utc::now()),
            ..Default::default()
        };
        let reclaimed = self.store.sweep_expired(Utc::now(), change).await?;
        for vm in &reclaimed {
            warn!(vm_id = %vm.id, instance_id = %vm.instance_id, "reclaimed expired lease");
        }
        Ok(reclaimed)
    }

    /// Aggregate pool view.
    pub async fn pool_status(&self) -> Result<PoolStatus> {
        Ok(PoolStatus::from_vms(self.store.list().await?))
    }
}
