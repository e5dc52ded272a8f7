//! Workflows API - /api/workflows
//!
//! POST /api/workflows/run       - Enqueue a workflow from a YAML definition
//! GET  /api/workflows/runs      - List workflow runs
//! GET  /api/workflows/runs/{id} - Get one run with its step tasks

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::models::background_task::TriggerSource;
use ensemble_core::state::AppState;
use ensemble_core::workflow::WorkflowDefinition;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/run", post(run_workflow))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunBody {
    /// Workflow definition as a YAML string.
    yaml: String,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    trigger_payload: Option<String>,
}

async fn run_workflow(
    State(state): State<AppState>,
    Json(body): Json<RunBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let definition = WorkflowDefinition::from_yaml(&body.yaml).map_err(ServerError::BadRequest)?;
    if definition.steps.is_empty() {
        return Err(ServerError::BadRequest(
            "Workflow has no steps".to_string(),
        ));
    }

    let run = state
        .workflow_runner
        .start_run(
            &definition,
            body.workspace_id.as_deref().unwrap_or("default"),
            TriggerSource::Manual,
            body.trigger_payload,
        )
        .await?;

    Ok(Json(serde_json::json!({ "run": run })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunsQuery {
    workspace_id: Option<String>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let runs = state
        .workflow_run_store
        .list_by_workspace(q.workspace_id.as_deref().unwrap_or("default"), q.limit.unwrap_or(50))
        .await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let run = state
        .workflow_run_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Workflow run not found: {}", id)))?;
    let tasks = state.background_task_store.list_by_workflow_run(&id).await?;
    Ok(Json(serde_json::json!({ "run": run, "tasks": tasks })))
}
