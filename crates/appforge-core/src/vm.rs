//! VM records and lease bookkeeping types.
//!
//! A VM is a pooled worker machine. It is created at registration, leased to
//! exactly one project at a time, and never deleted while reachable: pruning
//! moves it to `error`, re-registration returns it to `idle`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ProjectId, ResourceId};

/// Pool-facing lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Available for claiming.
    Idle,
    /// Leased and serving a build.
    Busy,
    /// Leased, worker still booting the build environment.
    Starting,
    /// Heartbeat went stale; unusable until re-registered.
    Error,
}

impl VmStatus {
    /// Whether a claim may target a VM in this status.
    pub fn is_leasable(&self) -> bool {
        matches!(self, VmStatus::Idle)
    }

    /// Whether the VM currently holds a lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, VmStatus::Busy | VmStatus::Starting)
    }

    /// Statuses covered by the heartbeat liveness sweep.
    pub fn prunable() -> &'static [VmStatus] {
        &[VmStatus::Idle, VmStatus::Busy, VmStatus::Starting]
    }
}

/// Descriptive substate reported by the worker process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    /// Worker up, waiting for work.
    Serving,
    /// Lease granted, build environment booting.
    Starting,
    /// Build in progress.
    Building,
    /// Worker unreachable or faulted.
    Error,
}

/// A pooled worker VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Unique identifier.
    pub id: ResourceId,
    /// Cloud instance name (e.g. GCE instance id). Stable across restarts.
    pub instance_id: String,
    /// Base URL the worker serves on.
    pub base_url: String,
    /// Pool lifecycle state.
    pub status: VmStatus,
    /// Worker-reported substate.
    pub runtime_state: RuntimeState,
    /// Owning project while leased.
    pub project_id: Option<ProjectId>,
    /// Build the leased worker should run.
    pub desired_build_id: Option<ResourceId>,
    /// Lease-holder label, e.g. "project:<id>".
    pub lease_owner: Option<String>,
    /// When the current lease expires. Set iff the VM is leased.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last worker heartbeat.
    pub last_heartbeat_at: DateTime<Utc>,
    /// When the VM last left a lease (release or prune).
    pub last_shutdown_at: Option<DateTime<Utc>>,
    /// When the VM registered.
    pub created_at: DateTime<Utc>,
    /// Last store mutation. Maintained by the store.
    pub updated_at: DateTime<Utc>,
}

impl Vm {
    /// A freshly registered VM: idle, serving, heartbeat now.
    pub fn registered(instance_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            instance_id: instance_id.into(),
            base_url: base_url.into(),
            status: VmStatus::Idle,
            runtime_state: RuntimeState::Serving,
            project_id: None,
            desired_build_id: None,
            lease_owner: None,
            lease_expires_at: None,
            last_heartbeat_at: now,
            last_shutdown_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field-level patch applied by a conditional update.
///
/// `Some(..)` fields are written, `None` fields are left untouched. Nullable
/// columns take a nested `Option` so a patch can distinguish "clear" from
/// "keep".
#[derive(Debug, Clone, Default)]
pub struct VmChange {
    pub status: Option<VmStatus>,
    pub runtime_state: Option<RuntimeState>,
    pub base_url: Option<String>,
    pub project_id: Option<Option<ProjectId>>,
    pub desired_build_id: Option<Option<ResourceId>>,
    pub lease_owner: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_shutdown_at: Option<DateTime<Utc>>,
}

impl VmChange {
    pub fn apply(&self, vm: &mut Vm, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            vm.status = status;
        }
        if let Some(state) = self.runtime_state {
            vm.runtime_state = state;
        }
        if let Some(url) = &self.base_url {
            vm.base_url = url.clone();
        }
        if let Some(project_id) = &self.project_id {
            vm.project_id = project_id.clone();
        }
        if let Some(build_id) = self.desired_build_id {
            vm.desired_build_id = build_id;
        }
        if let Some(owner) = &self.lease_owner {
            vm.lease_owner = owner.clone();
        }
        if let Some(expires) = self.lease_expires_at {
            vm.lease_expires_at = expires;
        }
        if let Some(heartbeat) = self.last_heartbeat_at {
            vm.last_heartbeat_at = heartbeat;
        }
        if let Some(shutdown) = self.last_shutdown_at {
            vm.last_shutdown_at = Some(shutdown);
        }
        vm.updated_at = now;
    }
}

/// Aggregate view of the pool, per status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub starting: usize,
    pub error: usize,
    pub vms: Vec<Vm>,
}

impl PoolStatus {
    pub fn from_vms(vms: Vec<Vm>) -> Self {
        let count = |status: VmStatus| vms.iter().filter(|vm| vm.status == status).count();
        let (idle, busy, starting, error) = (
            count(VmStatus::Idle),
            count(VmStatus::Busy),
            count(VmStatus::Starting),
            count(VmStatus::Error),
        );
        Self {
            total: vms.len(),
            idle,
            busy,
            starting,
            error,
            vms,
        }
    }
}
