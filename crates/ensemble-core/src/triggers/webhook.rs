//! GitHub webhook receiver.
//!
//! For each configured repo hook:
//!   1. verify the `X-Hub-Signature-256` HMAC over the raw body bytes
//!      (constant-time comparison; an empty secret accepts everything)
//!   2. match event type (or wildcard) and, for issues, the label filter
//!   3. render the prompt template and create a background task
//!   4. append a trigger log row with outcome triggered / skipped / error
//!
//! A failed log append never blocks dispatch; an invalid signature never
//! creates a task but always leaves exactly one `error` log row per
//! matching config.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ServerError;
use crate::models::background_task::{BackgroundTask, TaskPriority, TriggerSource};
use crate::models::webhook::{TriggerOutcome, WebhookConfig, WebhookTriggerLog};
use crate::store::{BackgroundTaskStore, WebhookStore};

type HmacSha256 = Hmac<Sha256>;

/// What happened for one config during event handling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResult {
    pub config_id: String,
    pub outcome: TriggerOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct WebhookReceiver {
    webhook_store: WebhookStore,
    background_store: BackgroundTaskStore,
}

impl WebhookReceiver {
    pub fn new(webhook_store: WebhookStore, background_store: BackgroundTaskStore) -> Self {
        Self {
            webhook_store,
            background_store,
        }
    }

    /// Handle one webhook delivery against every enabled config for its repo.
    pub async fn handle_event(
        &self,
        event_type: &str,
        signature: Option<&str>,
        raw_body: &[u8],
        payload: &serde_json::Value,
    ) -> Result<Vec<TriggerResult>, ServerError> {
        let repo = payload
            .pointer("/repository/full_name")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let configs: Vec<WebhookConfig> = self
            .webhook_store
            .list_enabled_configs()
            .await?
            .into_iter()
            .filter(|c| repo.is_empty() || c.repo == repo)
            .collect();

        let mut results = Vec::new();
        for config in configs {
            let signature_valid = verify_signature(&config.webhook_secret, raw_body, signature);
            let result = if !signature_valid {
                tracing::warn!(
                    "[Webhook] invalid signature for config {} ({})",
                    config.id,
                    config.repo
                );
                self.log(
                    &config,
                    event_type,
                    payload,
                    false,
                    TriggerOutcome::Error,
                    None,
                    Some("Invalid webhook signature"),
                )
                .await;
                TriggerResult {
                    config_id: config.id.clone(),
                    outcome: TriggerOutcome::Error,
                    background_task_id: None,
                    error: Some("Invalid webhook signature".to_string()),
                }
            } else {
                self.dispatch_matched(&config, event_type, payload, true, TriggerSource::Webhook)
                    .await
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Match + dispatch for an already-trusted event. The polling adapter
    /// enters here after converting the Events-API payload shape.
    pub async fn dispatch_matched(
        &self,
        config: &WebhookConfig,
        event_type: &str,
        payload: &serde_json::Value,
        signature_valid: bool,
        source: TriggerSource,
    ) -> TriggerResult {
        if !matches_event(config, event_type, payload) {
            self.log(
                config,
                event_type,
                payload,
                signature_valid,
                TriggerOutcome::Skipped,
                None,
                None,
            )
            .await;
            return TriggerResult {
                config_id: config.id.clone(),
                outcome: TriggerOutcome::Skipped,
                background_task_id: None,
                error: None,
            };
        }

        let action = payload.get("action").and_then(|v| v.as_str());
        let prompt = build_prompt(config, event_type, payload);
        let task = BackgroundTask::new(
            uuid::Uuid::new_v4().to_string(),
            format!("[GitHub {}] {}", event_type, event_title(event_type, payload)),
            prompt,
            config.trigger_agent_id.clone(),
            config
                .workspace_id
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            config.repo.clone(),
            source,
            TaskPriority::Normal,
        );

        match self.background_store.save(&task).await {
            Ok(()) => {
                tracing::info!(
                    "[Webhook] dispatched task {} for {}/{} via config {}",
                    task.id,
                    event_type,
                    action.unwrap_or("-"),
                    config.id
                );
                self.log(
                    config,
                    event_type,
                    payload,
                    signature_valid,
                    TriggerOutcome::Triggered,
                    Some(&task.id),
                    None,
                )
                .await;
                TriggerResult {
                    config_id: config.id.clone(),
                    outcome: TriggerOutcome::Triggered,
                    background_task_id: Some(task.id),
                    error: None,
                }
            }
            Err(e) => {
                let msg = format!("Failed to create background task: {}", e);
                self.log(
                    config,
                    event_type,
                    payload,
                    signature_valid,
                    TriggerOutcome::Error,
                    None,
                    Some(&msg),
                )
                .await;
                TriggerResult {
                    config_id: config.id.clone(),
                    outcome: TriggerOutcome::Error,
                    background_task_id: None,
                    error: Some(msg),
                }
            }
        }
    }

    /// Append a trigger log row; failures are logged and swallowed so
    /// bookkeeping never blocks dispatch.
    #[allow(clippy::too_many_arguments)]
    async fn log(
        &self,
        config: &WebhookConfig,
        event_type: &str,
        payload: &serde_json::Value,
        signature_valid: bool,
        outcome: TriggerOutcome,
        background_task_id: Option<&str>,
        error_message: Option<&str>,
    ) {
        let mut log = WebhookTriggerLog::new(config.id.clone(), event_type.to_string(), outcome);
        log.event_action = payload
            .get("action")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        log.payload = payload.clone();
        log.background_task_id = background_task_id.map(|s| s.to_string());
        log.signature_valid = signature_valid;
        log.error_message = error_message.map(|s| s.to_string());

        if let Err(e) = self.webhook_store.append_log(&log).await {
            tracing::error!("[Webhook] trigger log append failed: {}", e);
        }
    }
}

// ─── Signature Verification ─────────────────────────────────────────────

/// Verify an `X-Hub-Signature-256` header (`sha256=<hex>`) over the raw body
/// bytes. Comparison is constant-time. An empty secret accepts everything
/// (dev mode).
pub fn verify_signature(secret: &str, raw_body: &[u8], signature: Option<&str>) -> bool {
    if secret.is_empty() {
        return true;
    }
    let provided_hex = match signature.and_then(|s| s.strip_prefix("sha256=")) {
        Some(hex) => hex,
        None => return false,
    };
    let provided = match hex::decode(provided_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();

    expected.ct_eq(provided.as_slice()).into()
}

// ─── Matching ───────────────────────────────────────────────────────────

/// Event type must be configured (or wildcard); when a label filter is set
/// and the payload carries an issue, at least one label must match.
pub fn matches_event(config: &WebhookConfig, event_type: &str, payload: &serde_json::Value) -> bool {
    let type_match = config.event_types.contains("*")
        || config.event_types.contains(event_type)
        || config.event_types.contains(&format!(
            "{}.{}",
            event_type,
            payload.get("action").and_then(|v| v.as_str()).unwrap_or("")
        ));
    if !type_match {
        return false;
    }

    if let Some(filter) = &config.label_filter {
        if let Some(labels) = payload.pointer("/issue/labels").and_then(|v| v.as_array()) {
            let has_match = labels
                .iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                .any(|name| filter.contains(name));
            if !has_match {
                return false;
            }
        }
    }

    true
}

// ─── Prompt Building ────────────────────────────────────────────────────

const DEFAULT_PROMPT_TEMPLATE: &str = "GitHub {{event}} event ({{action}}) on {{repo}}:\n\n{{context}}\n\nHandle this event appropriately.";

/// Render the config's prompt template with the delivery's tokens.
pub fn build_prompt(
    config: &WebhookConfig,
    event_type: &str,
    payload: &serde_json::Value,
) -> String {
    let template = config
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT_TEMPLATE);
    let action = payload.get("action").and_then(|v| v.as_str()).unwrap_or("");
    template
        .replace("{{event}}", event_type)
        .replace("{{action}}", action)
        .replace("{{repo}}", &config.repo)
        .replace("{{context}}", &event_context(event_type, payload))
        .replace(
            "{{payload}}",
            &serde_json::to_string(payload).unwrap_or_default(),
        )
}

/// Short title used in the background task name.
fn event_title(event_type: &str, payload: &serde_json::Value) -> String {
    let title = match event_type {
        "issues" | "issue_comment" => payload.pointer("/issue/title"),
        "pull_request" | "pull_request_review" => payload.pointer("/pull_request/title"),
        "check_run" => payload.pointer("/check_run/name"),
        "check_suite" => payload.pointer("/check_suite/head_branch"),
        "workflow_run" => payload.pointer("/workflow_run/name"),
        "workflow_job" => payload.pointer("/workflow_job/name"),
        "create" | "delete" => payload.pointer("/ref"),
        _ => None,
    };
    title
        .and_then(|v| v.as_str())
        .unwrap_or("event")
        .to_string()
}

/// Event-type-specific synopsis for the `{{context}}` token.
pub fn event_context(event_type: &str, payload: &serde_json::Value) -> String {
    let str_at = |pointer: &str| {
        payload
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    let num_at = |pointer: &str| {
        payload
            .pointer(pointer)
            .and_then(|v| v.as_i64())
            .map(|n| n.to_string())
            .unwrap_or_default()
    };

    match event_type {
        "issues" => format!(
            "Issue #{}: {}\n{}",
            num_at("/issue/number"),
            str_at("/issue/title"),
            str_at("/issue/body"),
        ),
        "issue_comment" => format!(
            "Comment on issue #{} ({}):\n{}",
            num_at("/issue/number"),
            str_at("/issue/title"),
            str_at("/comment/body"),
        ),
        "pull_request" => format!(
            "PR #{}: {}\n{}",
            num_at("/pull_request/number"),
            str_at("/pull_request/title"),
            str_at("/pull_request/body"),
        ),
        "pull_request_review" => format!(
            "Review on PR #{} ({}): {}\n{}",
            num_at("/pull_request/number"),
            str_at("/pull_request/title"),
            str_at("/review/state"),
            str_at("/review/body"),
        ),
        "check_run" => format!(
            "Check run \"{}\": {} ({})",
            str_at("/check_run/name"),
            str_at("/check_run/status"),
            str_at("/check_run/conclusion"),
        ),
        "check_suite" => format!(
            "Check suite on {}: {} ({})",
            str_at("/check_suite/head_branch"),
            str_at("/check_suite/status"),
            str_at("/check_suite/conclusion"),
        ),
        "workflow_run" => format!(
            "Workflow \"{}\": {} ({})",
            str_at("/workflow_run/name"),
            str_at("/workflow_run/status"),
            str_at("/workflow_run/conclusion"),
        ),
        "workflow_job" => format!(
            "Workflow job \"{}\": {} ({})",
            str_at("/workflow_job/name"),
            str_at("/workflow_job/status"),
            str_at("/workflow_job/conclusion"),
        ),
        "create" => format!("Created {} {}", str_at("/ref_type"), str_at("/ref")),
        "delete" => format!("Deleted {} {}", str_at("/ref_type"), str_at("/ref")),
        _ => serde_json::to_string(payload).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::background_task::BackgroundTaskStatus;
    use std::collections::HashSet;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn issue_payload() -> serde_json::Value {
        serde_json::json!({
            "action": "opened",
            "repository": { "full_name": "acme/widgets" },
            "issue": {
                "number": 42,
                "title": "Crash on startup",
                "body": "It crashes",
                "labels": [{ "name": "bug" }]
            }
        })
    }

    fn config(secret: &str) -> WebhookConfig {
        let mut c = WebhookConfig::new(
            "cfg-1".to_string(),
            "acme/widgets".to_string(),
            "claude".to_string(),
        );
        c.event_types = HashSet::from(["issues".to_string()]);
        c.webhook_secret = secret.to_string();
        c
    }

    fn receiver() -> (WebhookReceiver, WebhookStore, BackgroundTaskStore) {
        let db = Database::open_in_memory().expect("in-memory db");
        let webhook_store = WebhookStore::new(db.clone());
        let background_store = BackgroundTaskStore::new(db);
        (
            WebhookReceiver::new(webhook_store.clone(), background_store.clone()),
            webhook_store,
            background_store,
        )
    }

    #[test]
    fn signature_verification_accepts_valid_rejects_bad() {
        let body = br#"{"action":"opened"}"#;
        let good = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, Some(&good)));
        assert!(!verify_signature("topsecret", body, Some("sha256=deadbeef")));
        assert!(!verify_signature("topsecret", body, None));
        assert!(!verify_signature("topsecret", body, Some("not-a-signature")));
        // Dev mode: empty secret accepts everything.
        assert!(verify_signature("", body, None));
    }

    #[test]
    fn event_matching_honors_types_and_labels() {
        let mut c = config("");
        assert!(matches_event(&c, "issues", &issue_payload()));
        assert!(!matches_event(&c, "pull_request", &issue_payload()));

        c.event_types = HashSet::from(["*".to_string()]);
        assert!(matches_event(&c, "pull_request", &issue_payload()));

        c.event_types = HashSet::from(["issues".to_string()]);
        c.label_filter = Some(HashSet::from(["bug".to_string()]));
        assert!(matches_event(&c, "issues", &issue_payload()));
        c.label_filter = Some(HashSet::from(["enhancement".to_string()]));
        assert!(!matches_event(&c, "issues", &issue_payload()));
    }

    #[test]
    fn prompt_template_tokens_resolve() {
        let mut c = config("");
        c.prompt_template = Some("{{event}}/{{action}} on {{repo}}: {{context}}".to_string());
        let prompt = build_prompt(&c, "issues", &issue_payload());
        assert!(prompt.starts_with("issues/opened on acme/widgets:"));
        assert!(prompt.contains("Issue #42: Crash on startup"));
    }

    #[tokio::test]
    async fn invalid_signature_logs_error_and_creates_nothing() {
        let (receiver, webhook_store, background_store) = receiver();
        webhook_store.save_config(&config("topsecret")).await.unwrap();

        let body = serde_json::to_vec(&issue_payload()).unwrap();
        let results = receiver
            .handle_event("issues", Some("sha256=0000"), &body, &issue_payload())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, TriggerOutcome::Error);

        let tasks = background_store.list(None, None, 10).await.unwrap();
        assert!(tasks.is_empty());

        let logs = webhook_store.list_logs(Some("cfg-1"), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, TriggerOutcome::Error);
        assert!(!logs[0].signature_valid);
    }

    #[tokio::test]
    async fn valid_signature_creates_one_task_with_title_prefix() {
        let (receiver, webhook_store, background_store) = receiver();
        webhook_store.save_config(&config("topsecret")).await.unwrap();

        let body = serde_json::to_vec(&issue_payload()).unwrap();
        let sig = sign("topsecret", &body);
        let results = receiver
            .handle_event("issues", Some(&sig), &body, &issue_payload())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, TriggerOutcome::Triggered);

        let tasks = background_store.list(None, None, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].title.starts_with("[GitHub issues]"));
        assert_eq!(tasks[0].trigger_source, TriggerSource::Webhook);
        assert_eq!(tasks[0].status, BackgroundTaskStatus::Pending);

        let logs = webhook_store.list_logs(Some("cfg-1"), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, TriggerOutcome::Triggered);
        assert_eq!(logs[0].background_task_id.as_deref(), Some(tasks[0].id.as_str()));
    }

    #[tokio::test]
    async fn unmatched_event_type_is_skipped() {
        let (receiver, webhook_store, background_store) = receiver();
        webhook_store.save_config(&config("")).await.unwrap();

        let payload = serde_json::json!({
            "action": "opened",
            "repository": { "full_name": "acme/widgets" },
            "pull_request": { "number": 7, "title": "Fix", "body": "" }
        });
        let body = serde_json::to_vec(&payload).unwrap();
        let results = receiver
            .handle_event("pull_request", None, &body, &payload)
            .await
            .unwrap();

        assert_eq!(results[0].outcome, TriggerOutcome::Skipped);
        assert!(background_store.list(None, None, 10).await.unwrap().is_empty());
    }
}
