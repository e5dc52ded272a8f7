//! Client streaming gateway - /api/acp
//!
//! POST /api/acp            — JSON-RPC surface (initialize, session/new,
//!                            session/prompt, session/cancel, session/set_mode,
//!                            _providers/list)
//! GET  /api/acp?sessionId= — SSE stream of `session/update` notifications
//!                            for one attached session. Child-session updates
//!                            are injected upstream by the orchestrator,
//!                            tagged with `childAgentId`/`childSessionId` and
//!                            rewritten to the parent's session id.

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;

use ensemble_core::acp::{self, CreateSessionOptions};
use ensemble_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(acp_sse).post(acp_rpc))
}

/// POST /api/acp — Handle JSON-RPC requests from the client.
async fn acp_rpc(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = body.get("id").cloned().unwrap_or(serde_json::json!(null));
    let params = body.get("params").cloned().unwrap_or_default();

    match method {
        "initialize" => {
            let protocol_version = params
                .get("protocolVersion")
                .and_then(|v| v.as_u64())
                .unwrap_or(1);
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": protocol_version,
                    "agentCapabilities": { "loadSession": false },
                    "agentInfo": {
                        "name": "ensemble",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }
            }))
        }

        "_providers/list" => {
            let providers: Vec<serde_json::Value> = acp::get_presets()
                .iter()
                .map(|preset| {
                    let installed = preset.shape == "sdk"
                        || acp::which(&preset.command).is_some();
                    serde_json::json!({
                        "id": preset.name,
                        "name": preset.name,
                        "description": preset.description,
                        "command": preset.command,
                        "shape": preset.shape,
                        "status": if installed { "available" } else { "unavailable" },
                    })
                })
                .collect();
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "providers": providers }
            }))
        }

        "session/new" => {
            let cwd = params
                .get("cwd")
                .and_then(|v| v.as_str())
                .unwrap_or(".")
                .to_string();
            let workspace_id = params
                .get("workspaceId")
                .and_then(|v| v.as_str())
                .unwrap_or("default")
                .to_string();
            let opts = CreateSessionOptions {
                provider: params
                    .get("provider")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                role: params
                    .get("role")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_uppercase()),
                model: params
                    .get("model")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                mode_id: params
                    .get("modeId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                ..Default::default()
            };
            let provider = opts.provider.clone();
            let role = opts.role.clone();

            let session_id = uuid::Uuid::new_v4().to_string();
            tracing::info!(
                "[ACP Route] Creating session: provider={:?}, cwd={}, role={:?}",
                provider,
                cwd,
                role
            );

            match state
                .session_manager
                .create_session(&session_id, &cwd, &workspace_id, opts)
                .await
            {
                Ok(_provider_sid) => Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "sessionId": session_id,
                        "provider": provider.as_deref().unwrap_or("opencode"),
                        "role": role.as_deref().unwrap_or("ROUTA"),
                    }
                })),
                Err(e) => {
                    tracing::error!("[ACP Route] Failed to create session: {}", e);
                    Json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": -32000,
                            "message": format!("Failed to create session: {}", e)
                        }
                    }))
                }
            }
        }

        "session/prompt" => {
            let session_id = match params.get("sessionId").and_then(|v| v.as_str()) {
                Some(sid) => sid.to_string(),
                None => {
                    return Json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32602, "message": "Missing sessionId" }
                    }));
                }
            };

            // Extract prompt text from content blocks
            let prompt_text = params
                .get("prompt")
                .and_then(|v| v.as_array())
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();

            tracing::info!(
                "[ACP Route] session/prompt: session={}, prompt_len={}",
                session_id,
                prompt_text.len()
            );

            // Cold-start recovery before giving up on an unknown session.
            if state.session_manager.get_adapter(&session_id).await.is_none() {
                match state
                    .session_manager
                    .get_or_recreate_adapter(&session_id)
                    .await
                {
                    Ok(Some(_)) => {
                        tracing::info!("[ACP Route] Recovered session {} from persistence", session_id);
                    }
                    Ok(None) => {
                        return Json(serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32000, "message": format!("Session not found: {}", session_id) }
                        }));
                    }
                    Err(e) => {
                        return Json(serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32000, "message": e.to_string() }
                        }));
                    }
                }
            }

            match state.session_manager.prompt(&session_id, &prompt_text).await {
                Ok(result) => Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result,
                })),
                Err(e) => {
                    tracing::error!("[ACP Route] Prompt failed: {}", e);
                    Json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32000, "message": e.to_string() }
                    }))
                }
            }
        }

        "session/cancel" => {
            if let Some(sid) = params.get("sessionId").and_then(|v| v.as_str()) {
                // Cancel propagates to children under this session.
                state.orchestrator.cancel_with_children(sid).await;
            }
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "cancelled": true }
            }))
        }

        "session/set_mode" => {
            let session_id = params.get("sessionId").and_then(|v| v.as_str());
            let mode_id = params
                .get("modeId")
                .or_else(|| params.get("mode"))
                .and_then(|v| v.as_str());
            if let (Some(sid), Some(mode)) = (session_id, mode_id) {
                if let Err(e) = state.session_manager.set_session_mode(sid, mode).await {
                    tracing::warn!("[ACP Route] set_mode failed: {}", e);
                }
            }
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            }))
        }

        _ => Json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": -32601,
                "message": format!("Method not found: {}", method)
            }
        })),
    }
}

/// GET /api/acp?sessionId=xxx — SSE stream for session/update notifications.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcpSseQuery {
    session_id: Option<String>,
}

async fn acp_sse(
    State(state): State<AppState>,
    Query(query): Query<AcpSseQuery>,
) -> Sse<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>> {
    let session_id = query.session_id.clone().unwrap_or_default();

    // Send initial connected event
    let connected_event = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": session_id,
            "update": {
                "sessionUpdate": "agent_thought_chunk",
                "content": { "type": "text", "text": "Connected to session." }
            }
        }
    });

    let initial = tokio_stream::once(Ok::<_, Infallible>(
        Event::default().data(connected_event.to_string()),
    ));

    // Heartbeat (keep connection alive)
    let heartbeat = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_secs(15),
    ))
    .map(|_| Ok(Event::default().comment("heartbeat")));

    type SseStream =
        std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>;

    // Attach: subscribe to the session's raw notification channel. Detach is
    // the client dropping the connection (the receiver goes with it).
    let stream: SseStream = if let Some(mut rx) =
        state.session_manager.subscribe(&session_id).await
    {
        let notifications = async_stream::stream! {
            while let Ok(msg) = rx.recv().await {
                yield Ok::<_, Infallible>(
                    Event::default().data(msg.to_string())
                );
            }
        };
        Box::pin(initial.chain(tokio_stream::StreamExt::merge(notifications, heartbeat)))
    } else {
        // No live session — just initial + heartbeat
        Box::pin(initial.chain(heartbeat))
    };

    Sse::new(stream)
}
