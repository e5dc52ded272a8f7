use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackgroundTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackgroundTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Webhook,
    Fleet,
    Polling,
    Workflow,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
            Self::Fleet => "fleet",
            Self::Polling => "polling",
            Self::Workflow => "workflow",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "schedule" => Self::Schedule,
            "webhook" => Self::Webhook,
            "fleet" => Self::Fleet,
            "polling" => Self::Polling,
            "workflow" => Self::Workflow,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "HIGH" => Self::High,
            "LOW" => Self::Low,
            _ => Self::Normal,
        }
    }

    /// Queue rank: lower drains first.
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// A detached job on the persistent queue. A RUNNING task either has
/// `result_session_id` set or has been running for less than the orphan
/// threshold; otherwise the engine re-claims it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub id: String,
    pub title: String,
    pub prompt: String,
    /// Provider id used for the detached session.
    pub agent_id: String,
    pub workspace_id: String,
    pub status: BackgroundTaskStatus,
    pub triggered_by: String,
    pub trigger_source: TriggerSource,
    pub priority: TaskPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
    pub tool_call_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on_task_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_output: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundTask {
    pub fn new(
        id: String,
        title: String,
        prompt: String,
        agent_id: String,
        workspace_id: String,
        triggered_by: String,
        trigger_source: TriggerSource,
        priority: TaskPriority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            prompt,
            agent_id,
            workspace_id,
            status: BackgroundTaskStatus::Pending,
            triggered_by,
            trigger_source,
            priority,
            result_session_id: None,
            error_message: None,
            attempts: 0,
            max_attempts: 3,
            last_activity: None,
            current_activity: None,
            tool_call_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            workflow_run_id: None,
            workflow_step_name: None,
            depends_on_task_ids: None,
            task_output: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}
