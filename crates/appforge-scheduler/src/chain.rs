//! Per-project staged build chains.
//!
//! Each project has at most one active (queued or running) build. Follow-up
//! requests stage behind it as a singly linked chain of pending builds,
//! ordered by creation and capped at a configured length. The chain manager
//! is the only mutator of dependency edges; all chain reads and writes happen
//! inside one per-project critical section, so a splice is never observable
//! half-applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use appforge_config::ChainConfig;
use appforge_core::build::{Attachment, Build, BuildChange, BuildStatus};
use appforge_core::store::BuildStore;
use appforge_core::{Error, ProjectId, ResourceId, Result};
use tokio::sync::Mutex;
use tracing::info;

/// Chain bookkeeping for one project.
#[derive(Debug, Default)]
struct ChainState {
    /// The queued or running build, if any.
    active: Option<ResourceId>,
    /// Staged build ids, chain head first.
    staged: VecDeque<ResourceId>,
    /// A failed build freezes the chain until cleared.
    failed: Option<ResourceId>,
    /// Last version number handed out.
    last_version: u32,
}

/// Manages the staged build chain for every project.
pub struct ChainManager {
    store: Arc<dyn BuildStore>,
    chains: Mutex<HashMap<ProjectId, ChainState>>,
    config: ChainConfig,
}

impl ChainManager {
    pub fn new(store: Arc<dyn BuildStore>, config: ChainConfig) -> Self {
        Self {
            store,
            chains: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Handle a new build request for a project.
    ///
    /// With no active build the request starts immediately (`staged = false`).
    /// With an active build it is appended to the chain as a pending build
    /// depending on the current tail (`staged = true`).
    pub async fn create_message(
        &self,
        project_id: &ProjectId,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(Build, bool)> {
        let mut chains = self.chains.lock().await;
        let state = chains.entry(project_id.clone()).or_default();

        if state.failed.is_some() {
            return Err(Error::Conflict("build_failed".to_string()));
        }

        let version = state.last_version + 1;

        let Some(root) = state.active else {
            let build = self
                .store
                .insert(Build::new(
                    project_id.clone(),
                    BuildStatus::Queued,
                    None,
                    content,
                    attachments,
                    version,
                ))
                .await?;
            state.active = Some(build.id);
            state.last_version = version;
            info!(build_id = %build.id, project_id = %project_id, "created active build");
            return Ok((build, false));
        };

        if state.staged.len() >= self.config.max_staged_builds {
            return Err(Error::Conflict("max_staged_builds".to_string()));
        }

        let depends_on = state.staged.back().copied().unwrap_or(root);
        let build = self
            .store
            .insert(Build::new(
                project_id.clone(),
                BuildStatus::Pending,
                Some(depends_on),
                content,
                attachments,
                version,
            ))
            .await?;
        state.staged.push_back(build.id);
        state.last_version = version;
        info!(
            build_id = %build.id,
            project_id = %project_id,
            depends_on = %depends_on,
            chain_len = state.staged.len(),
            "staged build"
        );
        Ok((build, true))
    }

    /// The staged builds of a project, chain head (oldest) first.
    pub async fn staged_builds(&self, project_id: &ProjectId) -> Result<Vec<Build>> {
        let chains = self.chains.lock().await;
        let Some(state) = chains.get(project_id) else {
            return Ok(Vec::new());
        };
        let mut builds = Vec::with_capacity(state.staged.len());
        for id in &state.staged {
            let build = self
                .store
                .get(*id)
                .await?
                .ok_or_else(|| Error::Internal(format!("staged build {id} missing from store")))?;
            builds.push(build);
        }
        Ok(builds)
    }

    /// Fetch one build record.
    pub async fn build(&self, build_id: ResourceId) -> Result<Option<Build>> {
        self.store.get(build_id).await
    }

    /// Delete a staged build and splice the chain around it.
    ///
    /// The successor's dependency is rewritten to the deleted node's own
    /// dependency (its predecessor, or the chain root when deleting the head)
    /// in the same critical section as the removal.
    pub async fn delete_staged(&self, build_id: ResourceId) -> Result<()> {
        let mut chains = self.chains.lock().await;
        let build = self
            .store
            .get(build_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;

        let position = chains
            .get_mut(&build.project_id)
            .and_then(|state| state.staged.iter().position(|id| *id == build_id));
        let Some(position) = position else {
            return Err(Error::Validation("can_only_delete_staged".to_string()));
        };
        let state = chains
            .get_mut(&build.project_id)
            .ok_or_else(|| Error::Internal(format!("no chain for {}", build.project_id)))?;

        if let Some(successor) = state.staged.get(position + 1).copied() {
            let change = BuildChange {
                depends_on_build_id: Some(build.depends_on_build_id),
                ..Default::default()
            };
            self.store
                .update_where(successor, &[BuildStatus::Pending], change)
                .await?
                .ok_or_else(|| {
                    Error::Internal(format!("chain successor {successor} not pending"))
                })?;
        }
        state.staged.remove(position);
        self.store.remove(build_id).await?;
        info!(
            build_id = %build_id,
            project_id = %build.project_id,
            chain_len = state.staged.len(),
            "deleted staged build"
        );
        Ok(())
    }

    /// Edit the content of a staged build. Fails once the build has been
    /// promoted out of pending.
    pub async fn edit_staged(&self, build_id: ResourceId, content: &str) -> Result<Build> {
        if self.store.get(build_id).await?.is_none() {
            return Err(Error::NotFound(format!("build {build_id}")));
        }
        let change = BuildChange {
            content: Some(content.to_string()),
            ..Default::default()
        };
        self.store
            .update_where(build_id, &[BuildStatus::Pending], change)
            .await?
            .ok_or_else(|| Error::Conflict("staged_locked".to_string()))
    }

    /// Promote the chain head out of pending, making it the project's active
    /// build. Returns `None` when there is nothing to promote, or when the
    /// chain is occupied or frozen.
    pub async fn promote_next(&self, project_id: &ProjectId) -> Result<Option<Build>> {
        let mut chains = self.chains.lock().await;
        let Some(state) = chains.get_mut(project_id) else {
            return Ok(None);
        };
        if state.active.is_some() || state.failed.is_some() {
            return Ok(None);
        }
        let Some(head) = state.staged.pop_front() else {
            return Ok(None);
        };

        let change = BuildChange {
            status: Some(BuildStatus::Queued),
            ..Default::default()
        };
        let promoted = self
            .store
            .update_where(head, &[BuildStatus::Pending], change)
            .await?
            .ok_or_else(|| Error::Internal(format!("chain head {head} not pending")))?;
        state.active = Some(promoted.id);
        info!(build_id = %promoted.id, project_id = %project_id, "promoted staged build");
        Ok(Some(promoted))
    }

    /// Record that the active build started running on its VM.
    pub async fn record_running(&self, build_id: ResourceId) -> Result<Option<Build>> {
        let change = BuildChange {
            status: Some(BuildStatus::Running),
            ..Default::default()
        };
        self.store
            .update_where(build_id, &[BuildStatus::Queued], change)
            .await
    }

    /// Record a successful terminal status, vacating the active slot.
    /// Returns `None` when the build was not active (stale report).
    pub async fn record_succeeded(&self, build_id: ResourceId) -> Result<Option<Build>> {
        let mut chains = self.chains.lock().await;
        let change = BuildChange {
            status: Some(BuildStatus::Succeeded),
            ..Default::default()
        };
        let updated = self
            .store
            .update_where(
                build_id,
                &[BuildStatus::Queued, BuildStatus::Running],
                change,
            )
            .await?;
        let Some(build) = updated else {
            return Ok(None);
        };
        if let Some(state) = chains.get_mut(&build.project_id) {
            if state.active == Some(build_id) {
                state.active = None;
            }
        }
        info!(build_id = %build_id, project_id = %build.project_id, "build succeeded");
        Ok(Some(build))
    }

    /// Record a failed terminal status. The chain freezes: nothing promotes
    /// and new messages are rejected until the failure is cleared.
    pub async fn record_failed(
        &self,
        build_id: ResourceId,
        error_code: Option<String>,
    ) -> Result<Option<Build>> {
        let mut chains = self.chains.lock().await;
        let change = BuildChange {
            status: Some(BuildStatus::Failed),
            error_code: Some(error_code),
            ..Default::default()
        };
        let updated = self
            .store
            .update_where(
                build_id,
                &[BuildStatus::Queued, BuildStatus::Running],
                change,
            )
            .await?;
        let Some(build) = updated else {
            return Ok(None);
        };
        if let Some(state) = chains.get_mut(&build.project_id) {
            if state.active == Some(build_id) {
                state.active = None;
            }
            state.failed = Some(build_id);
        }
        info!(
            build_id = %build_id,
            project_id = %build.project_id,
            error_code = build.error_code.as_deref().unwrap_or(""),
            "build failed, chain frozen"
        );
        Ok(Some(build))
    }

    /// Clear a failure by putting the failed build back in the queue as the
    /// active build. The frozen chain resumes behind it.
    pub async fn clear_failure(&self, build_id: ResourceId) -> Result<Build> {
        let mut chains = self.chains.lock().await;
        let change = BuildChange {
            status: Some(BuildStatus::Queued),
            error_code: Some(None),
            ..Default::default()
        };
        let build = self
            .store
            .update_where(build_id, &[BuildStatus::Failed], change)
            .await?
            .ok_or_else(|| Error::Validation("build is not in failed state".to_string()))?;
        if let Some(state) = chains.get_mut(&build.project_id) {
            if state.failed == Some(build_id) {
                state.failed = None;
                state.active = Some(build_id);
            }
        }
        info!(build_id = %build_id, project_id = %build.project_id, "cleared failed build");
        Ok(build)
    }
}
