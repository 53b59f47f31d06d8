//! Store traits for VMs and builds.
//!
//! The primitive every implementation must provide is the atomic conditional
//! update: apply a patch only if the row's current status matches an expected
//! set, as one indivisible step. Claim, prune, and promotion are all built on
//! it; none of them may be implemented as a read followed by a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::build::{Build, BuildChange, BuildStatus};
use crate::vm::{Vm, VmChange, VmStatus};
use crate::{ProjectId, ResourceId, Result};

/// Storage for the VM pool.
#[async_trait]
pub trait VmStore: Send + Sync {
    async fn insert(&self, vm: Vm) -> Result<Vm>;

    async fn get(&self, id: ResourceId) -> Result<Option<Vm>>;

    async fn get_by_instance(&self, instance_id: &str) -> Result<Option<Vm>>;

    async fn list(&self) -> Result<Vec<Vm>>;

    /// Conditionally update one VM: apply `change` iff the VM's current status
    /// is in `expected`. Returns the updated VM, or `None` when the condition
    /// did not hold (zero rows affected, nothing mutated).
    async fn update_where(
        &self,
        id: ResourceId,
        expected: &[VmStatus],
        change: VmChange,
    ) -> Result<Option<Vm>>;

    /// Unconditionally update one VM by instance id. Returns `None` when the
    /// instance is unknown.
    async fn update_instance(&self, instance_id: &str, change: VmChange) -> Result<Option<Vm>>;

    /// Bulk conditional update: apply `change` to every VM whose status is in
    /// `statuses` and whose last heartbeat is older than `heartbeat_before`.
    /// Returns the VMs that were updated.
    async fn sweep_where(
        &self,
        statuses: &[VmStatus],
        heartbeat_before: DateTime<Utc>,
        change: VmChange,
    ) -> Result<Vec<Vm>>;

    /// Bulk conditional update for lease expiry: apply `change` to every
    /// leased VM whose `lease_expires_at` is before `now`.
    async fn sweep_expired(&self, now: DateTime<Utc>, change: VmChange) -> Result<Vec<Vm>>;
}

/// Storage for build records. The chain structure itself is owned by the
/// chain manager; this is the arena the chain's ids point into.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert(&self, build: Build) -> Result<Build>;

    async fn get(&self, id: ResourceId) -> Result<Option<Build>>;

    /// Conditionally update one build: apply `change` iff the build's current
    /// status is in `expected`. Returns `None` when the condition did not hold.
    async fn update_where(
        &self,
        id: ResourceId,
        expected: &[BuildStatus],
        change: BuildChange,
    ) -> Result<Option<Build>>;

    /// Remove a build record. Returns the removed build, or `None` if absent.
    async fn remove(&self, id: ResourceId) -> Result<Option<Build>>;

    /// All builds for a project, unordered.
    async fn for_project(&self, project_id: &ProjectId) -> Result<Vec<Build>>;
}
