//! Tool endpoint — the coordination tools agents call back into.
//!
//! Wire contract: each tool takes one JSON object and returns the
//! `{success, data?, error?}` envelope. Tool names are part of the contract
//! and referenced by agent prompts:
//!
//!   create_task, list_tasks, delegate_task_to_agent, create_note,
//!   read_note, list_notes, set_note_content, convert_task_blocks,
//!   list_agents, get_agent_status, read_agent_conversation,
//!   send_message_to_agent, report_to_parent, set_agent_name
//!
//! Delegation itself lives in the orchestrator; everything else is here.

pub mod task_blocks;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::events::{AgentEvent, AgentEventType, EventBus};
use crate::models::agent::AgentStatus;
use crate::models::message::{Message, MessageRole};
use crate::models::note::{Note, NoteType, SPEC_NOTE_ID};
use crate::models::task::{Task, TaskStatus, VerificationVerdict};
use crate::store::{AgentStore, ConversationStore, NoteStore, TaskPatch, TaskStore};
use std::sync::Arc;

/// Result envelope for every tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or_default()),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Completion report from a child agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub summary: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_modified: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_results: Option<String>,
}

/// Parameters for `create_task`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskParams {
    pub title: String,
    pub objective: String,
    pub workspace_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub verification_commands: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub parallel_group: Option<String>,
}

/// Coordination tools shared by every agent session.
pub struct AgentTools {
    agent_store: AgentStore,
    conversation_store: ConversationStore,
    task_store: TaskStore,
    note_store: NoteStore,
    event_bus: Arc<EventBus>,
}

impl AgentTools {
    pub fn new(
        agent_store: AgentStore,
        conversation_store: ConversationStore,
        task_store: TaskStore,
        note_store: NoteStore,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agent_store,
            conversation_store,
            task_store,
            note_store,
            event_bus,
        }
    }

    // ─── Tasks ───────────────────────────────────────────────────────────

    pub async fn create_task(&self, params: CreateTaskParams) -> Result<ToolResult, ServerError> {
        let task = Task::new(
            uuid::Uuid::new_v4().to_string(),
            params.title,
            params.objective,
            params.workspace_id,
            params.session_id,
            params.scope,
            params.acceptance_criteria,
            params.verification_commands,
            params.dependencies,
            params.parallel_group,
        );

        self.task_store.save(&task).await?;

        Ok(ToolResult::success(serde_json::json!({
            "taskId": task.id,
            "title": task.title,
            "status": task.status,
        })))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<ToolResult, ServerError> {
        match self.task_store.get(task_id).await? {
            Some(task) => Ok(ToolResult::success(task)),
            None => Ok(ToolResult::error(format!("Task not found: {}", task_id))),
        }
    }

    pub async fn list_tasks(
        &self,
        workspace_id: &str,
        status_filter: Option<&str>,
    ) -> Result<ToolResult, ServerError> {
        let tasks = match status_filter.and_then(TaskStatus::from_str) {
            Some(status) => self.task_store.list_by_status(workspace_id, &status).await?,
            None => self.task_store.list_by_workspace(workspace_id).await?,
        };
        let summary: Vec<serde_json::Value> = tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "title": t.title,
                    "objective": t.objective,
                    "status": t.status,
                    "assignedTo": t.assigned_to,
                    "verificationVerdict": t.verification_verdict,
                })
            })
            .collect();
        Ok(ToolResult::success(summary))
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: &str,
        agent_id: &str,
        summary: Option<&str>,
    ) -> Result<ToolResult, ServerError> {
        let new_status = match TaskStatus::from_str(status) {
            Some(s) => s,
            None => {
                return Ok(ToolResult::error(format!(
                    "Invalid status: {}. Must be one of: PENDING, IN_PROGRESS, COMPLETED, BLOCKED, NEEDS_FIX",
                    status
                )))
            }
        };

        let task = match self.task_store.get(task_id).await? {
            Some(t) => t,
            None => return Ok(ToolResult::error(format!("Task not found: {}", task_id))),
        };

        let old_status = task.status.clone();
        let patch = TaskPatch {
            status: Some(new_status.clone()),
            completion_summary: summary.map(|s| s.to_string()),
            ..Default::default()
        };
        let task = self.task_store.atomic_update(task_id, task.version, patch).await?;

        self.event_bus
            .emit(AgentEvent {
                event_type: AgentEventType::TaskStatusChanged,
                agent_id: agent_id.to_string(),
                workspace_id: task.workspace_id.clone(),
                data: serde_json::json!({
                    "taskId": task_id,
                    "oldStatus": old_status,
                    "newStatus": new_status,
                    "summary": summary,
                }),
                timestamp: chrono::Utc::now(),
            })
            .await;

        if new_status == TaskStatus::Completed {
            self.event_bus
                .emit(AgentEvent {
                    event_type: AgentEventType::TaskCompleted,
                    agent_id: agent_id.to_string(),
                    workspace_id: task.workspace_id.clone(),
                    data: serde_json::json!({
                        "taskId": task_id,
                        "taskTitle": task.title,
                        "summary": summary,
                    }),
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }

        Ok(ToolResult::success(serde_json::json!({
            "taskId": task_id,
            "oldStatus": old_status,
            "newStatus": new_status,
            "updatedAt": task.updated_at.to_rfc3339(),
        })))
    }

    // ─── Notes ───────────────────────────────────────────────────────────

    pub async fn create_note(
        &self,
        workspace_id: &str,
        title: &str,
        content: &str,
        note_type: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<ToolResult, ServerError> {
        let mut note = Note::new(
            uuid::Uuid::new_v4().to_string(),
            workspace_id.to_string(),
            title.to_string(),
            content.to_string(),
            note_type.map(NoteType::from_str).unwrap_or(NoteType::General),
        );
        note.session_id = session_id.map(|s| s.to_string());
        self.note_store.save(&note).await?;

        Ok(ToolResult::success(serde_json::json!({
            "noteId": note.id,
            "title": note.title,
        })))
    }

    pub async fn read_note(
        &self,
        note_id: &str,
        workspace_id: &str,
    ) -> Result<ToolResult, ServerError> {
        // The spec note materializes on first read.
        if note_id == SPEC_NOTE_ID {
            let note = self.note_store.ensure_spec(workspace_id).await?;
            return Ok(ToolResult::success(note));
        }
        match self.note_store.get(note_id, workspace_id).await? {
            Some(note) => Ok(ToolResult::success(note)),
            None => Ok(ToolResult::error(format!("Note not found: {}", note_id))),
        }
    }

    pub async fn list_notes(&self, workspace_id: &str) -> Result<ToolResult, ServerError> {
        let notes = self.note_store.list_by_workspace(workspace_id).await?;
        let summary: Vec<serde_json::Value> = notes
            .iter()
            .map(|n| {
                serde_json::json!({
                    "id": n.id,
                    "title": n.title,
                    "type": n.metadata.note_type,
                    "updatedAt": n.updated_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(ToolResult::success(summary))
    }

    /// Write a note's content. On the spec note, `@@@task` blocks are
    /// atomically materialized into Task rows; the new task ids come back in
    /// the result.
    pub async fn set_note_content(
        &self,
        note_id: &str,
        workspace_id: &str,
        content: &str,
    ) -> Result<ToolResult, ServerError> {
        let mut note = if note_id == SPEC_NOTE_ID {
            self.note_store.ensure_spec(workspace_id).await?
        } else {
            match self.note_store.get(note_id, workspace_id).await? {
                Some(n) => n,
                None => return Ok(ToolResult::error(format!("Note not found: {}", note_id))),
            }
        };

        note.content = content.to_string();
        note.updated_at = chrono::Utc::now();
        self.note_store.save(&note).await?;

        let task_ids = if note.metadata.note_type == NoteType::Spec {
            self.materialize_task_blocks(&note).await?
        } else {
            Vec::new()
        };

        Ok(ToolResult::success(serde_json::json!({
            "noteId": note.id,
            "taskIds": task_ids,
        })))
    }

    /// Manual `@@@task` block conversion for any note.
    pub async fn convert_task_blocks(
        &self,
        note_id: &str,
        workspace_id: &str,
    ) -> Result<ToolResult, ServerError> {
        let note = match self.note_store.get(note_id, workspace_id).await? {
            Some(n) => n,
            None => return Ok(ToolResult::error(format!("Note not found: {}", note_id))),
        };

        let task_ids = self.materialize_task_blocks(&note).await?;
        Ok(ToolResult::success(serde_json::json!({
            "noteId": note.id,
            "taskIds": task_ids,
        })))
    }

    /// Convert each `@@@task` block into a Task row; all rows land in one
    /// transaction.
    async fn materialize_task_blocks(&self, note: &Note) -> Result<Vec<String>, ServerError> {
        let blocks = task_blocks::parse_task_blocks(&note.content);
        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let mut ids = Vec::new();
        for block in blocks {
            let id = uuid::Uuid::new_v4().to_string();
            ids.push(id.clone());
            tasks.push(Task::new(
                id,
                block.title,
                block.objective,
                note.workspace_id.clone(),
                note.session_id.clone(),
                block.scope,
                if block.acceptance_criteria.is_empty() {
                    None
                } else {
                    Some(block.acceptance_criteria)
                },
                if block.verification_commands.is_empty() {
                    None
                } else {
                    Some(block.verification_commands)
                },
                None,
                block.parallel_group,
            ));
        }

        self.task_store.save_batch(tasks).await?;
        tracing::info!(
            "[AgentTools] Materialized {} task blocks from note {}",
            ids.len(),
            note.id
        );
        Ok(ids)
    }

    // ─── Agents ──────────────────────────────────────────────────────────

    pub async fn list_agents(&self, workspace_id: &str) -> Result<ToolResult, ServerError> {
        let agents = self.agent_store.list_by_workspace(workspace_id).await?;
        let summary: Vec<serde_json::Value> = agents
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "name": a.name,
                    "role": a.role,
                    "status": a.status,
                    "parentId": a.parent_id,
                })
            })
            .collect();
        Ok(ToolResult::success(summary))
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Result<ToolResult, ServerError> {
        let agent = match self.agent_store.get(agent_id).await? {
            Some(a) => a,
            None => return Ok(ToolResult::error(format!("Agent not found: {}", agent_id))),
        };

        let message_count = self.conversation_store.get_message_count(agent_id).await?;
        let tasks = self.task_store.list_by_assignee(agent_id).await?;

        Ok(ToolResult::success(serde_json::json!({
            "agentId": agent.id,
            "name": agent.name,
            "role": agent.role,
            "status": agent.status,
            "modelTier": agent.model_tier,
            "parentId": agent.parent_id,
            "messageCount": message_count,
            "tasks": tasks.iter().map(|t| serde_json::json!({
                "id": t.id,
                "title": t.title,
                "status": t.status,
            })).collect::<Vec<_>>(),
        })))
    }

    pub async fn read_agent_conversation(
        &self,
        agent_id: &str,
        last_n: Option<usize>,
        start_turn: Option<i32>,
        end_turn: Option<i32>,
        include_tool_calls: bool,
    ) -> Result<ToolResult, ServerError> {
        let agent = match self.agent_store.get(agent_id).await? {
            Some(a) => a,
            None => return Ok(ToolResult::error(format!("Agent not found: {}", agent_id))),
        };

        let mut messages = if let Some(n) = last_n {
            self.conversation_store.get_last_n(agent_id, n).await?
        } else if let (Some(start), Some(end)) = (start_turn, end_turn) {
            self.conversation_store
                .get_by_turn_range(agent_id, start, end)
                .await?
        } else {
            self.conversation_store.get_conversation(agent_id).await?
        };

        if !include_tool_calls {
            messages.retain(|m| m.role != MessageRole::Tool);
        }

        Ok(ToolResult::success(serde_json::json!({
            "agentId": agent_id,
            "agentName": agent.name,
            "messageCount": messages.len(),
            "messages": messages.iter().map(|m| serde_json::json!({
                "role": m.role,
                "content": m.content,
                "turn": m.turn,
                "toolName": m.tool_name,
                "timestamp": m.timestamp.to_rfc3339(),
            })).collect::<Vec<_>>(),
        })))
    }

    pub async fn send_message_to_agent(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        message: &str,
    ) -> Result<ToolResult, ServerError> {
        let to_agent = match self.agent_store.get(to_agent_id).await? {
            Some(a) => a,
            None => {
                return Ok(ToolResult::error(format!(
                    "Target agent not found: {}",
                    to_agent_id
                )))
            }
        };

        let msg = Message::new(
            uuid::Uuid::new_v4().to_string(),
            to_agent_id.to_string(),
            MessageRole::User,
            format!("[From agent {}]: {}", from_agent_id, message),
            None,
            None,
            None,
        );
        self.conversation_store.append(&msg).await?;

        self.event_bus
            .emit(AgentEvent {
                event_type: AgentEventType::MessageSent,
                agent_id: from_agent_id.to_string(),
                workspace_id: to_agent.workspace_id.clone(),
                data: serde_json::json!({
                    "fromAgentId": from_agent_id,
                    "toAgentId": to_agent_id,
                    "messagePreview": &message[..message.len().min(200)],
                }),
                timestamp: chrono::Utc::now(),
            })
            .await;

        Ok(ToolResult::success(serde_json::json!({
            "delivered": true,
            "toAgentId": to_agent_id,
            "fromAgentId": from_agent_id,
        })))
    }

    pub async fn set_agent_name(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<ToolResult, ServerError> {
        if self.agent_store.get(agent_id).await?.is_none() {
            return Ok(ToolResult::error(format!("Agent not found: {}", agent_id)));
        }
        self.agent_store.update_name(agent_id, name).await?;
        Ok(ToolResult::success(serde_json::json!({
            "agentId": agent_id,
            "name": name,
        })))
    }

    // ─── Report to Parent ────────────────────────────────────────────────

    /// Persist a child's completion report and announce it. The orchestrator
    /// listens for the `REPORT_SUBMITTED` event and handles the wake-up.
    pub async fn report_to_parent(
        &self,
        agent_id: &str,
        report: CompletionReport,
    ) -> Result<ToolResult, ServerError> {
        let agent = match self.agent_store.get(agent_id).await? {
            Some(a) => a,
            None => return Ok(ToolResult::error(format!("Agent not found: {}", agent_id))),
        };

        let parent_id = match &agent.parent_id {
            Some(p) => p.clone(),
            None => {
                return Ok(ToolResult::error(format!(
                    "Agent {} has no parent to report to",
                    agent_id
                )))
            }
        };

        // Update the task, including verification fields when present.
        if let Some(task_id) = &report.task_id {
            if let Some(task) = self.task_store.get(task_id).await? {
                let patch = TaskPatch {
                    status: Some(if report.success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::NeedsFix
                    }),
                    completion_summary: Some(report.summary.clone()),
                    verification_verdict: report.verification_results.as_ref().map(|_| {
                        if report.success {
                            VerificationVerdict::Approved
                        } else {
                            VerificationVerdict::NotApproved
                        }
                    }),
                    verification_report: report.verification_results.clone(),
                    ..Default::default()
                };
                self.task_store.atomic_update(task_id, task.version, patch).await?;
            }
        }

        let final_status = if report.success {
            AgentStatus::Completed
        } else {
            AgentStatus::Error
        };
        self.agent_store.update_status(agent_id, &final_status).await?;

        // Deliver the report into the parent's conversation.
        let content = format!(
            "[Completion Report from {} ({})]\nTask: {:?}\nSuccess: {}\nSummary: {}\n{}",
            agent.name,
            agent_id,
            report.task_id,
            report.success,
            report.summary,
            report
                .files_modified
                .as_ref()
                .map(|f| format!("Files Modified: {}", f.join(", ")))
                .unwrap_or_default()
        );
        let msg = Message::new(
            uuid::Uuid::new_v4().to_string(),
            parent_id.clone(),
            MessageRole::User,
            content,
            None,
            None,
            None,
        );
        self.conversation_store.append(&msg).await?;

        self.event_bus
            .emit(AgentEvent {
                event_type: AgentEventType::ReportSubmitted,
                agent_id: agent_id.to_string(),
                workspace_id: agent.workspace_id.clone(),
                data: serde_json::json!({
                    "parentId": parent_id,
                    "report": report,
                }),
                timestamp: chrono::Utc::now(),
            })
            .await;

        Ok(ToolResult::success(serde_json::json!({
            "reported": true,
            "parentId": parent_id,
            "success": report.success,
        })))
    }
}
