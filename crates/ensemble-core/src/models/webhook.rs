use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Configuration for one GitHub repository hook. An empty `webhook_secret`
/// accepts unsigned deliveries (dev mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub id: String,
    /// "owner/repo"
    pub repo: String,
    /// Event types to match; "*" matches everything.
    pub event_types: HashSet<String>,
    /// When set, an issue event must carry at least one of these labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_filter: Option<HashSet<String>>,
    /// Provider id for the spawned background session.
    pub trigger_agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub webhook_secret: String,
    pub github_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn new(id: String, repo: String, trigger_agent_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo,
            event_types: HashSet::new(),
            label_filter: None,
            trigger_agent_id,
            workspace_id: None,
            webhook_secret: String::new(),
            github_token: String::new(),
            prompt_template: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOutcome {
    Triggered,
    Skipped,
    Error,
}

impl TriggerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "triggered" => Self::Triggered,
            "error" => Self::Error,
            _ => Self::Skipped,
        }
    }
}

/// Audit row written for every config considered during event handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerLog {
    pub id: String,
    pub config_id: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_action: Option<String>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_task_id: Option<String>,
    pub signature_valid: bool,
    pub outcome: TriggerOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookTriggerLog {
    pub fn new(config_id: String, event_type: String, outcome: TriggerOutcome) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config_id,
            event_type,
            event_action: None,
            payload: serde_json::Value::Null,
            background_task_id: None,
            signature_valid: false,
            outcome,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}
