//! Background Tasks API - /api/background-tasks
//!
//! GET    /api/background-tasks              - List tasks
//! POST   /api/background-tasks              - Enqueue a new task
//! GET    /api/background-tasks/{id}         - Get a task by ID
//! DELETE /api/background-tasks/{id}         - Cancel a task
//! POST   /api/background-tasks/{id}/retry   - Retry a failed task

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::models::background_task::{
    BackgroundTask, BackgroundTaskStatus, TaskPriority, TriggerSource,
};
use ensemble_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/{id}", get(get_task).delete(cancel_task))
        .route("/{id}/retry", axum::routing::post(retry_task))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    workspace_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let status = q.status.as_deref().and_then(BackgroundTaskStatus::from_str);
    let tasks = state
        .background_task_store
        .list(q.workspace_id.as_deref(), status.as_ref(), q.limit.unwrap_or(100))
        .await?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    title: String,
    prompt: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    max_attempts: Option<i64>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let mut task = BackgroundTask::new(
        uuid::Uuid::new_v4().to_string(),
        body.title,
        body.prompt,
        body.agent_id.unwrap_or_else(|| "anthropic-api".to_string()),
        body.workspace_id.unwrap_or_else(|| "default".to_string()),
        "api".to_string(),
        TriggerSource::Manual,
        body.priority
            .as_deref()
            .map(TaskPriority::from_str)
            .unwrap_or(TaskPriority::Normal),
    );
    if let Some(max) = body.max_attempts {
        task.max_attempts = max.max(1);
    }
    state.background_task_store.save(&task).await?;
    Ok(Json(serde_json::json!({ "task": task })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let task = state
        .background_task_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Background task not found: {}", id)))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.background_engine.cancel(&id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true, "id": id })))
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.background_engine.retry(&id).await?;
    Ok(Json(serde_json::json!({ "retried": true, "id": id })))
}
