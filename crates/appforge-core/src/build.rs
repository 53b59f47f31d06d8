//! Build records and the staged-build state machine.
//!
//! A build moves `pending -> {queued|running} -> {succeeded|failed}`. `pending`
//! is entered only at creation while another build is active for the project,
//! and exited only by promotion or staged deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ProjectId, ResourceId};

/// Status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Staged behind another build; `depends_on_build_id` is set.
    Pending,
    /// Promoted and waiting for a VM.
    Queued,
    /// Running on a leased VM.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed; freezes the project's chain until cleared.
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }

    /// The "active" states: exactly one build per project may be here.
    pub fn is_active(&self) -> bool {
        matches!(self, BuildStatus::Queued | BuildStatus::Running)
    }
}

/// An uploaded file attached to a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

/// A build request for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Unique identifier.
    pub id: ResourceId,
    /// Project this build belongs to.
    pub project_id: ProjectId,
    /// Current status.
    pub status: BuildStatus,
    /// The build this one is staged behind. Set iff status is pending,
    /// or as a historical record after promotion.
    pub depends_on_build_id: Option<ResourceId>,
    /// The user message driving the build.
    pub content: String,
    /// Files attached to the message.
    pub attachments: Vec<Attachment>,
    /// Per-project monotonically increasing version.
    pub version_number: u32,
    /// Failure code when status is failed.
    pub error_code: Option<String>,
    /// When the build was created.
    pub created_at: DateTime<Utc>,
    /// Last store mutation. Maintained by the store.
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// A new build record in the given start status.
    pub fn new(
        project_id: ProjectId,
        status: BuildStatus,
        depends_on_build_id: Option<ResourceId>,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        version_number: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            project_id,
            status,
            depends_on_build_id,
            content: content.into(),
            attachments,
            version_number,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field-level patch applied by a conditional update.
#[derive(Debug, Clone, Default)]
pub struct BuildChange {
    pub status: Option<BuildStatus>,
    pub depends_on_build_id: Option<Option<ResourceId>>,
    pub content: Option<String>,
    pub error_code: Option<Option<String>>,
}

impl BuildChange {
    pub fn apply(&self, build: &mut Build, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            build.status = status;
        }
        if let Some(depends_on) = self.depends_on_build_id {
            build.depends_on_build_id = depends_on;
        }
        if let Some(content) = &self.content {
            build.content = content.clone();
        }
        if let Some(code) = &self.error_code {
            build.error_code = code.clone();
        }
        build.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(BuildStatus::Succeeded.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(BuildStatus::Queued.is_active());
        assert!(BuildStatus::Running.is_active());
        assert!(!BuildStatus::Pending.is_active());
        assert!(!BuildStatus::Succeeded.is_active());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&BuildStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
    }

    #[test]
    fn test_build_wire_shape() {
        let build = Build::new(
            ProjectId::from("project-abc"),
            BuildStatus::Queued,
            None,
            "build a todo app",
            vec![],
            1,
        );
        let json = serde_json::to_value(&build).unwrap();
        assert_eq!(json["project_id"], "project-abc");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["version_number"], 1);
        assert!(json["depends_on_build_id"].is_null());
    }

    #[test]
    fn test_change_rewrites_dependency() {
        let dep = ResourceId::new();
        let mut build = Build::new(
            ProjectId::from("project-abc"),
            BuildStatus::Pending,
            Some(ResourceId::new()),
            "add dark mode",
            vec![],
            2,
        );
        let change = BuildChange {
            depends_on_build_id: Some(Some(dep)),
            ..Default::default()
        };
        change.apply(&mut build, Utc::now());
        assert_eq!(build.depends_on_build_id, Some(dep));
        assert_eq!(build.status, BuildStatus::Pending);
    }
}
