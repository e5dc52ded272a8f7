//! Sessions API - /api/sessions
//!
//! Live registry snapshots plus persisted session rows (history included for
//! single-session reads).

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions))
        .route("/{id}", get(get_session).delete(kill_session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsQuery {
    workspace_id: Option<String>,
    limit: Option<usize>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(q): Query<SessionsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let live = state.session_manager.list_sessions().await;
    let persisted = state
        .acp_session_store
        .list(q.workspace_id.as_deref(), q.limit)
        .await?;
    Ok(Json(serde_json::json!({
        "live": live,
        "sessions": persisted.iter().map(|s| serde_json::json!({
            "id": s.id,
            "name": s.name,
            "cwd": s.cwd,
            "workspaceId": s.workspace_id,
            "provider": s.provider,
            "role": s.role,
            "modeId": s.mode_id,
            "firstPromptSent": s.first_prompt_sent,
            "createdAt": s.created_at,
            "updatedAt": s.updated_at,
        })).collect::<Vec<_>>(),
    })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let session = state
        .acp_session_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::SessionNotFound(id.clone()))?;
    let alive = state.session_manager.is_alive(&id).await;
    Ok(Json(serde_json::json!({ "session": session, "alive": alive })))
}

async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.orchestrator.cleanup(&id).await;
    state.session_manager.kill_session(&id).await;
    Ok(Json(serde_json::json!({ "killed": true, "id": id })))
}
