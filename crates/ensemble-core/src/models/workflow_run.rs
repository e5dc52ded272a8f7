use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution of a workflow definition. `completed_steps` never exceeds
/// `total_steps`; terminal runs are never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub workspace_id: String,
    pub status: WorkflowRunStatus,
    pub trigger_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    #[serde(default)]
    pub step_outputs: HashMap<String, String>,
    pub total_steps: i64,
    pub completed_steps: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        id: String,
        workflow_id: String,
        workflow_name: String,
        workflow_version: String,
        workspace_id: String,
        trigger_source: String,
        trigger_payload: Option<String>,
        total_steps: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id,
            workflow_name,
            workflow_version,
            workspace_id,
            status: WorkflowRunStatus::Pending,
            trigger_source,
            trigger_payload,
            current_step_name: None,
            step_outputs: HashMap::new(),
            total_steps,
            completed_steps: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
