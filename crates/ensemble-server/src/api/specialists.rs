//! Specialists API - /api/specialists

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::models::agent::{AgentRole, ModelTier};
use ensemble_core::models::specialist::{Specialist, SpecialistSource};
use ensemble_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_specialists).post(save_specialist))
        .route("/{id}", get(get_specialist).delete(delete_specialist))
}

async fn list_specialists(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let specialists = state.specialists.list().await;
    Ok(Json(serde_json::json!({ "specialists": specialists })))
}

async fn get_specialist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let specialist = state
        .specialists
        .get(&id)
        .await
        .ok_or_else(|| ServerError::UnknownSpecialist(id.clone()))?;
    Ok(Json(serde_json::json!({ "specialist": specialist })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecialistBody {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    role: String,
    #[serde(default)]
    default_model_tier: Option<String>,
    system_prompt: String,
    #[serde(default)]
    role_reminder: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn save_specialist(
    State(state): State<AppState>,
    Json(body): Json<SpecialistBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let role = AgentRole::from_str(&body.role).ok_or_else(|| {
        ServerError::BadRequest(format!(
            "Invalid role: {}. Must be one of: ROUTA, CRAFTER, GATE, DEVELOPER",
            body.role
        ))
    })?;

    let specialist = Specialist {
        id: body.id.to_lowercase(),
        name: body.name,
        description: body.description,
        role,
        default_model_tier: body
            .default_model_tier
            .as_deref()
            .and_then(ModelTier::from_str)
            .unwrap_or(ModelTier::Smart),
        system_prompt: body.system_prompt,
        role_reminder: body.role_reminder.unwrap_or_default(),
        model: body.model,
        enabled: body.enabled,
        source: SpecialistSource::User,
    };

    state.specialists.save(specialist.clone()).await?;
    Ok(Json(serde_json::json!({ "specialist": specialist })))
}

async fn delete_specialist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.specialists.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}
