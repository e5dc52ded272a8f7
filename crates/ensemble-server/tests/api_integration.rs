//! Integration tests for the HTTP surface.
//!
//! Exercise the axum router directly with in-memory databases, covering the
//! webhook receiver (signature handling), the tool endpoint (spec-note task
//! extraction, delegation error surfaces), and the health check.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use tower::ServiceExt;

use ensemble_core::models::webhook::WebhookConfig;
use ensemble_core::state::AppState;
use ensemble_server::{api, create_app_state};

async fn test_app() -> (Router, AppState) {
    let state = create_app_state(":memory:")
        .await
        .expect("Failed to build app state");
    let app = Router::new()
        .merge(api::api_router())
        .with_state(state.clone());
    (app, state)
}

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("JSON body")
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ─── Webhooks ─────────────────────────────────────────────────────────────

fn issue_payload() -> serde_json::Value {
    serde_json::json!({
        "action": "opened",
        "repository": { "full_name": "acme/widgets" },
        "issue": { "number": 42, "title": "Crash on startup", "body": "It crashes", "labels": [] }
    })
}

async fn install_config(state: &AppState, secret: &str) {
    let mut config = WebhookConfig::new(
        "cfg-test".to_string(),
        "acme/widgets".to_string(),
        "claude".to_string(),
    );
    config.event_types = ["issues".to_string()].into_iter().collect();
    config.webhook_secret = secret.to_string();
    state.webhook_store.save_config(&config).await.unwrap();
}

#[tokio::test]
async fn webhook_with_bad_signature_creates_no_task_and_logs_error() {
    let (app, state) = test_app().await;
    install_config(&state, "topsecret").await;

    let body = serde_json::to_vec(&issue_payload()).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/github")
        .header("content-type", "application/json")
        .header("X-GitHub-Event", "issues")
        .header("X-Hub-Signature-256", "sha256=deadbeef")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tasks = state
        .background_task_store
        .list(None, None, 10)
        .await
        .unwrap();
    assert!(tasks.is_empty());

    let logs = state
        .webhook_store
        .list_logs(Some("cfg-test"), 10)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].outcome.as_str(), "error");
}

#[tokio::test]
async fn webhook_with_valid_signature_dispatches_one_task() {
    let (app, state) = test_app().await;
    install_config(&state, "topsecret").await;

    let body = serde_json::to_vec(&issue_payload()).unwrap();
    let signature = sign("topsecret", &body);
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/github")
        .header("content-type", "application/json")
        .header("X-GitHub-Event", "issues")
        .header("X-Hub-Signature-256", signature)
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tasks = state
        .background_task_store
        .list(None, None, 10)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].title.starts_with("[GitHub issues]"));
    assert_eq!(tasks[0].trigger_source.as_str(), "webhook");
}

// ─── Tool Endpoint ────────────────────────────────────────────────────────

#[tokio::test]
async fn spec_note_content_materializes_task_blocks() {
    let (app, state) = test_app().await;

    let content = "@@@task\n# T1\n## Objective\n- do X\n@@@\n@@@task\n# T2\n## Objective\n- do Y\n@@@";
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/tools/set_note_content",
            &serde_json::json!({
                "noteId": "spec",
                "workspaceId": "default",
                "content": content,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let envelope = response_json(response).await;
    assert_eq!(envelope["success"], true);
    let task_ids: Vec<String> = envelope["data"]["taskIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(task_ids.len(), 2);

    // Returned ids resolve to real tasks with the block objectives.
    let tasks = state.task_store.list_by_workspace("default").await.unwrap();
    assert_eq!(tasks.len(), 2);
    for id in &task_ids {
        assert!(tasks.iter().any(|t| &t.id == id));
    }
    let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
    assert!(titles.contains(&"T1"));
    assert!(titles.contains(&"T2"));
    let objectives: Vec<&str> = tasks.iter().map(|t| t.objective.as_str()).collect();
    assert!(objectives.contains(&"do X"));
    assert!(objectives.contains(&"do Y"));
}

#[tokio::test]
async fn create_task_then_list_tasks_round_trip() {
    let (app, _state) = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/tools/create_task",
            &serde_json::json!({
                "title": "Add hello",
                "objective": "Add hello.txt",
                "workspaceId": "default",
            }),
        ))
        .await
        .unwrap();
    let envelope = response_json(response).await;
    assert_eq!(envelope["success"], true);
    let task_id = envelope["data"]["taskId"].as_str().unwrap().to_string();

    let response = app
        .oneshot(post_json(
            "/api/tools/list_tasks",
            &serde_json::json!({ "workspaceId": "default" }),
        ))
        .await
        .unwrap();
    let envelope = response_json(response).await;
    let tasks = envelope["data"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["id"], task_id.as_str());
    assert_eq!(tasks[0]["status"], "PENDING");
}

#[tokio::test]
async fn delegation_with_name_shaped_task_id_returns_hint() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(post_json(
            "/api/tools/delegate_task_to_agent",
            &serde_json::json!({
                "taskId": "openspec-ts-enhance-parser",
                "callerAgentId": "coordinator",
                "callerSessionId": "session-1",
                "workspaceId": "default",
                "specialist": "CRAFTER",
            }),
        ))
        .await
        .unwrap();
    let envelope = response_json(response).await;
    assert_eq!(envelope["success"], false);
    let error = envelope["error"].as_str().unwrap();
    assert!(error.contains("looks like a task name, not a UUID"));
    assert!(error.contains("create_task"));
    assert!(error.contains("convert_task_blocks"));
}

#[tokio::test]
async fn unknown_tool_returns_error_envelope() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(post_json("/api/tools/no_such_tool", &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = response_json(response).await;
    assert_eq!(envelope["success"], false);
    assert!(envelope["error"].as_str().unwrap().contains("Unknown tool"));
}

// ─── Workspaces ───────────────────────────────────────────────────────────

#[tokio::test]
async fn new_workspace_gets_a_spec_note() {
    let (app, state) = test_app().await;

    let response = app
        .oneshot(post_json(
            "/api/workspaces",
            &serde_json::json!({ "title": "Project X" }),
        ))
        .await
        .unwrap();
    let body = response_json(response).await;
    let workspace_id = body["workspace"]["id"].as_str().unwrap();

    let note = state
        .note_store
        .get("spec", workspace_id)
        .await
        .unwrap()
        .expect("spec note should exist");
    assert_eq!(note.metadata.note_type.as_str(), "spec");
}
