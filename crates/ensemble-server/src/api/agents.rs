//! Agents API - /api/agents

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
        .route("/", get(list_agents))
        .route("/{id}", get(get_agent).delete(delete_agent))
        .route("/{id}/conversation", get(get_conversation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    workspace_id: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let agents = state
        .agent_store
        .list_by_workspace(q.workspace_id.as_deref().unwrap_or("default"))
        .await?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let agent = state
        .agent_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Agent not found: {}", id)))?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.agent_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationQuery {
    last_n: Option<usize>,
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ConversationQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let messages = match q.last_n {
        Some(n) => state.conversation_store.get_last_n(&id, n).await?,
        None => state.conversation_store.get_conversation(&id).await?,
    };
    Ok(Json(serde_json::json!({ "agentId": id, "messages": messages })))
}
