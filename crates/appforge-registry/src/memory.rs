//! In-memory store implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use appforge_core::build::{Build, BuildChange, BuildStatus};
use appforge_core::store::{BuildStore, VmStore};
use appforge_core::vm::{Vm, VmChange, VmStatus};
use appforge_core::{Error, ProjectId, ResourceId, Result};

/// In-memory VM registry.
///
/// One mutex guards the whole table; each trait method is a single critical
/// section, which makes every conditional update linearizable.
#[derive(Default)]
pub struct MemVmStore {
    vms: Arc<Mutex<HashMap<ResourceId, Vm>>>,
}

impl MemVmStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VmStore for MemVmStore {
    async fn insert(&self, vm: Vm) -> Result<Vm> {
        let mut vms = self.vms.lock().await;
        if vms.values().any(|v| v.instance_id == vm.instance_id) {
            return Err(Error::Conflict(format!(
                "instance {} already registered",
                vm.instance_id
            )));
        }
        vms.insert(vm.id, vm.clone());
        Ok(vm)
    }

    async fn get(&self, id: ResourceId) -> Result<Option<Vm>> {
        Ok(self.vms.lock().await.get(&id).cloned())
    }

    async fn get_by_instance(&self, instance_id: &str) -> Result<Option<Vm>> {
        Ok(self
            .vms
            .lock()
            .await
            .values()
            .find(|vm| vm.instance_id == instance_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        let mut vms: Vec<Vm> = self.vms.lock().await.values().cloned().collect();
        vms.sort_by_key(|vm| vm.created_at);
        Ok(vms)
    }

    async fn update_where(
        &self,
        id: ResourceId,
        expected: &[VmStatus],
        change: VmChange,
    ) -> Result<Option<Vm>> {
        let mut vms = self.vms.lock().await;
        match vms.get_mut(&id) {
            Some(vm) if expected.contains(&vm.status) => {
                change.apply(vm, Utc::now());
                Ok(Some(vm.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_instance(&self, instance_id: &str, change: VmChange) -> Result<Option<Vm>> {
        let mut vms = self.vms.lock().await;
        match vms.values_mut().find(|vm| vm.instance_id == instance_id) {
            Some(vm) => {
                change.apply(vm, Utc::now());
                Ok(Some(vm.clone()))
            }
            None => Ok(None),
        }
    }

    async fn sweep_where(
        &self,
        statuses: &[VmStatus],
        heartbeat_before: DateTime<Utc>,
        change: VmChange,
    ) -> Result<Vec<Vm>> {
        let mut vms = self.vms.lock().await;
        let now = Utc::now();
        let mut swept = Vec::new();
        for vm in vms.values_mut() {
            if statuses.contains(&vm.status) && vm.last_heartbeat_at < heartbeat_before {
                change.apply(vm, now);
                swept.push(vm.clone());
            }
        }
        Ok(swept)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, change: VmChange) -> Result<Vec<Vm>> {
        let mut vms = self.vms.lock().await;
        let applied_at = Utc::now();
        let mut swept = Vec::new();
        for vm in vms.values_mut() {
            let expired = vm.status.is_leased()
                && vm.lease_expires_at.is_some_and(|expires| expires < now);
            if expired {
                change.apply(vm, applied_at);
                swept.push(vm.clone());
            }
        }
        Ok(swept)
    }
}

/// In-memory build arena.
#[derive(Default)]
pub struct MemBuildStore {
    builds: Arc<Mutex<HashMap<ResourceId, Build>>>,
}

impl MemBuildStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemBuildStore {
    async fn insert(&self, build: Build) -> Result<Build> {
        self.builds.lock().await.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get(&self, id: ResourceId) -> Result<Option<Build>> {
        Ok(self.builds.lock().await.get(&id).cloned())
    }

    async fn update_where(
        &self,
        id: ResourceId,
        expected: &[BuildStatus],
        change: BuildChange,
    ) -> Result<Option<Build>> {
        let mut builds = self.builds.lock().await;
        match builds.get_mut(&id) {
            Some(build) if expected.contains(&build.status) => {
                change.apply(build, Utc::now());
                Ok(Some(build.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn remove(&self, id: ResourceId) -> Result<Option<Build>> {
        Ok(self.builds.lock().await.remove(&id))
    }

    async fn for_project(&self, project_id: &ProjectId) -> Result<Vec<Build>> {
        Ok(self
            .builds
            .lock()
            .await
            .values()
            .filter(|build| &build.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_where_respects_expected_status() {
        let store = MemVmStore::new();
        let vm = store
            .insert(Vm::registered("inst-1", "http://localhost:9999/inst-1"))
            .await
            .unwrap();

        // Condition holds: idle -> busy.
        let claimed = store
            .update_where(
                vm.id,
                &[VmStatus::Idle],
                VmChange {
                    status: Some(VmStatus::Busy),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(claimed.is_some());

        // Condition no longer holds: zero rows, nothing mutated.
        let again = store
            .update_where(
                vm.id,
                &[VmStatus::Idle],
                VmChange {
                    status: Some(VmStatus::Error),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());
        let current = store.get(vm.id).await.unwrap().unwrap();
        assert_eq!(current.status, VmStatus::Busy);
    }

    #[tokio::test]
    async fn test_duplicate_instance_rejected() {
        let store = MemVmStore::new();
        store
            .insert(Vm::registered("inst-dup", "http://a"))
            .await
            .unwrap();
        let err = store
            .insert(Vm::registered("inst-dup", "http://b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_sweep_where_filters_on_status_and_heartbeat() {
        let store = MemVmStore::new();
        let mut stale = Vm::registered("stale", "http://stale");
        stale.last_heartbeat_at = Utc::now() - chrono::Duration::seconds(300);
        store.insert(stale).await.unwrap();
        store
            .insert(Vm::registered("fresh", "http://fresh"))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(90);
        let swept = store
            .sweep_where(
                VmStatus::prunable(),
                cutoff,
                VmChange {
                    status: Some(VmStatus::Error),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].instance_id, "stale");
        let fresh = store.get_by_instance("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, VmStatus::Idle);
    }

    #[tokio::test]
    async fn test_build_update_where_cas() {
        let store = MemBuildStore::new();
        let build = store
            .insert(Build::new(
                ProjectId::from("project-a"),
                BuildStatus::Pending,
                Some(ResourceId::new()),
                "add auth",
                vec![],
                2,
            ))
            .await
            .unwrap();

        let promoted = store
            .update_where(
                build.id,
                &[BuildStatus::Pending],
                BuildChange {
                    status: Some(BuildStatus::Queued),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(promoted.unwrap().status, BuildStatus::Queued);

        // A second promotion attempt misses.
        let missed = store
            .update_where(
                build.id,
                &[BuildStatus::Pending],
                BuildChange {
                    status: Some(BuildStatus::Queued),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(missed.is_none());
    }
}
