//! GitHub polling API - /api/polling
//!
//! The webhook alternative for hosts that can't receive deliveries.
//!
//! GET  /api/polling/config - Get current polling configuration
//! POST /api/polling/config - Update polling configuration
//! GET  /api/polling/check  - Get polling status
//! POST /api/polling/check  - Manually trigger a poll pass

use axum::{extract::State, routing::get, Json, Router};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config", get(get_config).post(update_config))
        .route("/check", get(get_status).post(check_now))
}

async fn get_config(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let config = state.poller.get_config().await;
    Ok(Json(serde_json::json!({ "ok": true, "config": config })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateConfigRequest {
    enabled: Option<bool>,
    interval_seconds: Option<u64>,
}

async fn update_config(
    State(state): State<AppState>,
    Json(body): Json<UpdateConfigRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if let Some(enabled) = body.enabled {
        state.poller.set_enabled(enabled).await;
        tracing::info!("[Polling] {}", if enabled { "enabled" } else { "disabled" });
    }
    if let Some(interval) = body.interval_seconds {
        state.poller.set_interval(interval).await;
    }
    let config = state.poller.get_config().await;
    Ok(Json(serde_json::json!({ "ok": true, "config": config })))
}

async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let config = state.poller.get_config().await;
    Ok(Json(serde_json::json!({
        "ok": true,
        "enabled": config.enabled,
        "intervalSeconds": config.interval_seconds,
        "lastCheckedAt": config.last_checked_at,
    })))
}

async fn check_now(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let results = state.poller.check_now().await?;
    let total_found: u32 = results.iter().map(|r| r.events_found).sum();
    let total_processed: u32 = results.iter().map(|r| r.events_processed).sum();

    tracing::info!(
        "[Polling] Check completed: {} repos, {} events found, {} processed",
        results.len(),
        total_found,
        total_processed
    );

    Ok(Json(serde_json::json!({
        "ok": true,
        "checkedAt": chrono::Utc::now().to_rfc3339(),
        "summary": {
            "reposChecked": results.len(),
            "totalEventsFound": total_found,
            "totalEventsProcessed": total_processed,
        },
        "results": results,
    })))
}
