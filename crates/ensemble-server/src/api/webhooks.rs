//! Webhooks API - /api/webhooks
//!
//! GET/POST         /api/webhooks/configs        - Manage webhook configurations
//! PUT/DELETE       /api/webhooks/configs/{id}   - Update / remove one config
//! POST             /api/webhooks/github         - Receive a GitHub delivery
//! POST/GET/DELETE  /api/webhooks/register       - Manage repo-side hooks
//! GET              /api/webhooks/logs           - List trigger logs
//!
//! The receiver reads the raw body bytes first — signature verification runs
//! over exactly what GitHub sent — then parses the JSON.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::models::webhook::WebhookConfig;
use ensemble_core::state::AppState;
use ensemble_core::triggers::GithubHooksClient;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/configs", get(list_configs).post(create_config))
        .route("/configs/{id}", axum::routing::put(update_config).delete(delete_config))
        .route("/github", post(handle_github_event))
        .route("/register", post(register_hook).get(list_hooks).delete(unregister_hook))
        .route("/logs", get(list_logs))
}

// ─── Configs ──────────────────────────────────────────────────────────────

async fn list_configs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let configs = state.webhook_store.list_configs().await?;
    Ok(Json(serde_json::json!({ "configs": configs })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigBody {
    repo: String,
    #[serde(default)]
    event_types: Vec<String>,
    #[serde(default)]
    label_filter: Option<Vec<String>>,
    trigger_agent_id: String,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    github_token: Option<String>,
    #[serde(default)]
    prompt_template: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn apply_body(config: &mut WebhookConfig, body: ConfigBody) {
    config.repo = body.repo;
    config.event_types = body.event_types.into_iter().collect();
    config.label_filter = body.label_filter.map(|v| v.into_iter().collect());
    config.trigger_agent_id = body.trigger_agent_id;
    config.workspace_id = body.workspace_id;
    if let Some(secret) = body.webhook_secret {
        config.webhook_secret = secret;
    }
    if let Some(token) = body.github_token {
        config.github_token = token;
    }
    config.prompt_template = body.prompt_template;
    config.enabled = body.enabled;
}

async fn create_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let mut config = WebhookConfig::new(
        uuid::Uuid::new_v4().to_string(),
        String::new(),
        String::new(),
    );
    apply_body(&mut config, body);
    state.webhook_store.save_config(&config).await?;
    Ok(Json(serde_json::json!({ "config": config })))
}

async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let mut config = state
        .webhook_store
        .get_config(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Webhook config not found: {}", id)))?;
    apply_body(&mut config, body);
    state.webhook_store.save_config(&config).await?;
    Ok(Json(serde_json::json!({ "config": config })))
}

async fn delete_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.webhook_store.delete_config(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}

// ─── Receiver ─────────────────────────────────────────────────────────────

/// POST /api/webhooks/github — GitHub delivery endpoint.
///
/// Headers: `X-GitHub-Event` (type), `X-Hub-Signature-256` (`sha256=<hex>`).
/// Always answers 200 to matched configs — outcomes live in the trigger log.
async fn handle_github_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ServerError> {
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("Invalid JSON payload: {}", e)))?;

    tracing::info!(
        "[Webhooks] {} delivery ({} bytes, signed: {})",
        event_type,
        body.len(),
        signature.is_some()
    );

    let results = state
        .webhook_receiver
        .handle_event(&event_type, signature.as_deref(), &body, &payload)
        .await?;

    Ok(Json(serde_json::json!({
        "processed": true,
        "eventType": event_type,
        "results": results,
    })))
}

// ─── Repo-side hook registration ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    repo: String,
    token: String,
    callback_url: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    hook_id: Option<i64>,
}

async fn register_hook(
    Json(body): Json<RegisterBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let events = if body.events.is_empty() {
        vec!["issues".to_string(), "pull_request".to_string()]
    } else {
        body.events
    };
    let hook = GithubHooksClient::new()
        .create_hook(&body.repo, &body.token, &body.callback_url, &body.secret, &events)
        .await?;
    Ok(Json(serde_json::json!({ "registered": true, "hook": hook })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HooksQuery {
    repo: String,
    token: String,
}

async fn list_hooks(
    Query(q): Query<HooksQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let hooks = GithubHooksClient::new().list_hooks(&q.repo, &q.token).await?;
    Ok(Json(serde_json::json!({ "hooks": hooks })))
}

async fn unregister_hook(
    Json(body): Json<RegisterBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let hook_id = body
        .hook_id
        .ok_or_else(|| ServerError::BadRequest("hookId is required".to_string()))?;
    GithubHooksClient::new()
        .delete_hook(&body.repo, &body.token, hook_id)
        .await?;
    Ok(Json(serde_json::json!({ "unregistered": true, "hookId": hook_id })))
}

// ─── Logs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    #[serde(default)]
    config_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let logs = state
        .webhook_store
        .list_logs(q.config_id.as_deref(), q.limit.unwrap_or(100))
        .await?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}
