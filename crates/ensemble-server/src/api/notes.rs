//! Notes API - /api/notes

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
        .route("/", get(list_notes))
        .route("/{id}", get(get_note).delete(delete_note))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotesQuery {
    workspace_id: Option<String>,
}

async fn list_notes(
    State(state): State<AppState>,
    Query(q): Query<NotesQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let notes = state
        .note_store
        .list_by_workspace(q.workspace_id.as_deref().unwrap_or("default"))
        .await?;
    Ok(Json(serde_json::json!({ "notes": notes })))
}

async fn get_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<NotesQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workspace_id = q.workspace_id.as_deref().unwrap_or("default");
    let note = state
        .note_store
        .get(&id, workspace_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Note not found: {}", id)))?;
    Ok(Json(serde_json::json!({ "note": note })))
}

async fn delete_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<NotesQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workspace_id = q.workspace_id.as_deref().unwrap_or("default");
    state.note_store.delete(&id, workspace_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}
