//! Workspaces API - /api/workspaces

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;

use ensemble_core::error::ServerError;
use ensemble_core::models::workspace::{Workspace, WorkspaceStatus};
use ensemble_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workspaces).post(create_workspace))
        .route("/{id}", get(get_workspace).put(update_workspace).delete(delete_workspace))
}

async fn list_workspaces(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workspaces = state.workspace_store.list().await?;
    Ok(Json(serde_json::json!({ "workspaces": workspaces })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceBody {
    title: String,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    status: Option<String>,
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(body): Json<WorkspaceBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workspace = Workspace::new(
        uuid::Uuid::new_v4().to_string(),
        body.title,
        body.metadata,
    );
    state.workspace_store.save(&workspace).await?;
    // Every workspace carries its singleton spec note from day one.
    state.note_store.ensure_spec(&workspace.id).await?;
    Ok(Json(serde_json::json!({ "workspace": workspace })))
}

async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workspace = state
        .workspace_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Workspace not found: {}", id)))?;
    Ok(Json(serde_json::json!({ "workspace": workspace })))
}

async fn update_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WorkspaceBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let mut workspace = state
        .workspace_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Workspace not found: {}", id)))?;
    workspace.title = body.title;
    if let Some(metadata) = body.metadata {
        workspace.metadata = metadata;
    }
    if let Some(status) = body.status {
        workspace.status = WorkspaceStatus::from_str(&status);
    }
    workspace.updated_at = chrono::Utc::now();
    state.workspace_store.save(&workspace).await?;
    Ok(Json(serde_json::json!({ "workspace": workspace })))
}

async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.workspace_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}
