//! Tool endpoint - /api/tools/{name}
//!
//! One POST route per the tool wire contract: the body is the tool's JSON
//! object, the response is the `{success, data?, error?}` envelope. Agents
//! reach this endpoint from their prompts; `delegate_task_to_agent` routes
//! into the orchestrator.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use ensemble_core::error::ServerError;
use ensemble_core::orchestration::DelegateWithSpawnParams;
use ensemble_core::state::AppState;
use ensemble_core::tools::{CompletionReport, CreateTaskParams, ToolResult};

pub fn router() -> Router<AppState> {
    Router::new().route("/{name}", post(invoke_tool))
}

fn invalid_args(tool: &str, e: impl std::fmt::Display) -> ToolResult {
    ToolResult::error(format!("Invalid arguments for {}: {}", tool, e))
}

async fn invoke_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ToolResult>, ServerError> {
    tracing::debug!("[Tools] {} called", name);
    let result = dispatch(&state, &name, body).await?;
    Ok(Json(result))
}

async fn dispatch(
    state: &AppState,
    name: &str,
    body: serde_json::Value,
) -> Result<ToolResult, ServerError> {
    match name {
        "create_task" => {
            let params: CreateTaskParams = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("create_task", e)),
            };
            state.tools.create_task(params).await
        }

        "list_tasks" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                workspace_id: String,
                #[serde(default)]
                status: Option<String>,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("list_tasks", e)),
            };
            state
                .tools
                .list_tasks(&params.workspace_id, params.status.as_deref())
                .await
        }

        "get_task" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                task_id: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("get_task", e)),
            };
            state.tools.get_task(&params.task_id).await
        }

        "update_task_status" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                task_id: String,
                status: String,
                agent_id: String,
                #[serde(default)]
                summary: Option<String>,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("update_task_status", e)),
            };
            state
                .tools
                .update_task_status(
                    &params.task_id,
                    &params.status,
                    &params.agent_id,
                    params.summary.as_deref(),
                )
                .await
        }

        "delegate_task_to_agent" => {
            let params: DelegateWithSpawnParams = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("delegate_task_to_agent", e)),
            };
            state.orchestrator.delegate_task_with_spawn(params).await
        }

        "create_note" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                workspace_id: String,
                title: String,
                #[serde(default)]
                content: String,
                #[serde(default, rename = "type")]
                note_type: Option<String>,
                #[serde(default)]
                session_id: Option<String>,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("create_note", e)),
            };
            state
                .tools
                .create_note(
                    &params.workspace_id,
                    &params.title,
                    &params.content,
                    params.note_type.as_deref(),
                    params.session_id.as_deref(),
                )
                .await
        }

        "read_note" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                note_id: String,
                workspace_id: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("read_note", e)),
            };
            state.tools.read_note(&params.note_id, &params.workspace_id).await
        }

        "list_notes" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                workspace_id: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("list_notes", e)),
            };
            state.tools.list_notes(&params.workspace_id).await
        }

        "set_note_content" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                note_id: String,
                workspace_id: String,
                content: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("set_note_content", e)),
            };
            state
                .tools
                .set_note_content(&params.note_id, &params.workspace_id, &params.content)
                .await
        }

        "convert_task_blocks" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                note_id: String,
                workspace_id: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("convert_task_blocks", e)),
            };
            state
                .tools
                .convert_task_blocks(&params.note_id, &params.workspace_id)
                .await
        }

        "list_agents" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                workspace_id: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("list_agents", e)),
            };
            state.tools.list_agents(&params.workspace_id).await
        }

        "get_agent_status" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                agent_id: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("get_agent_status", e)),
            };
            state.tools.get_agent_status(&params.agent_id).await
        }

        "read_agent_conversation" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                agent_id: String,
                #[serde(default)]
                last_n: Option<usize>,
                #[serde(default)]
                start_turn: Option<i32>,
                #[serde(default)]
                end_turn: Option<i32>,
                #[serde(default)]
                include_tool_calls: bool,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("read_agent_conversation", e)),
            };
            state
                .tools
                .read_agent_conversation(
                    &params.agent_id,
                    params.last_n,
                    params.start_turn,
                    params.end_turn,
                    params.include_tool_calls,
                )
                .await
        }

        "send_message_to_agent" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                from_agent_id: String,
                to_agent_id: String,
                message: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("send_message_to_agent", e)),
            };
            state
                .tools
                .send_message_to_agent(&params.from_agent_id, &params.to_agent_id, &params.message)
                .await
        }

        "report_to_parent" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                agent_id: String,
                report: CompletionReport,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("report_to_parent", e)),
            };
            state.tools.report_to_parent(&params.agent_id, params.report).await
        }

        "set_agent_name" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Params {
                agent_id: String,
                name: String,
            }
            let params: Params = match serde_json::from_value(body) {
                Ok(p) => p,
                Err(e) => return Ok(invalid_args("set_agent_name", e)),
            };
            state.tools.set_agent_name(&params.agent_id, &params.name).await
        }

        other => Ok(ToolResult::error(format!("Unknown tool: {}", other))),
    }
}
