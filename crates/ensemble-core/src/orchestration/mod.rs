//! Delegation orchestrator — spawns child agent sessions and wakes parents.
//!
//! The orchestrator bridges tool calls with real adapter sessions:
//!   1. Creates a child agent record (depth-checked)
//!   2. Spawns an adapter session for the child
//!   3. Sends the task as the initial prompt — without blocking the caller
//!   4. Forwards child updates onto the parent's stream, tagged
//!   5. When the child reports back (tool call, report file, or auto-report),
//!      wakes the parent agent
//!
//! `delegate_task_with_spawn` returns before the child's prompt resolves;
//! completion and error handling run on detached tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::acp::{CreateSessionOptions, SessionManager};
use crate::error::ServerError;
use crate::events::{AgentEvent, AgentEventType, EventBus};
use crate::models::agent::{
    Agent, AgentRole, AgentStatus, MAX_DELEGATION_DEPTH, META_CREATED_BY, META_DELEGATION_DEPTH,
    META_SPECIALIST,
};
use crate::models::specialist::Specialist;
use crate::models::task::{Task, TaskStatus};
use crate::specialists::SpecialistRegistry;
use crate::store::{AgentStore, TaskPatch, TaskStore};
use crate::tools::{AgentTools, CompletionReport, ToolResult};

// ─── Parameters & Config ──────────────────────────────────────────────────

/// Parameters for delegating a task with agent spawning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateWithSpawnParams {
    pub task_id: String,
    pub caller_agent_id: String,
    /// Calling agent's session ID (for wake-up)
    pub caller_session_id: String,
    pub workspace_id: String,
    /// Specialist role name ("CRAFTER") or specialist id ("issue-refiner")
    pub specialist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
    /// "immediate" or "after_all"
    #[serde(default = "default_wait_mode")]
    pub wait_mode: String,
}

fn default_wait_mode() -> String {
    "immediate".to_string()
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_crafter_provider: String,
    pub default_gate_provider: String,
    pub default_cwd: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_crafter_provider: "opencode".to_string(),
            default_gate_provider: "opencode".to_string(),
            default_cwd: ".".to_string(),
        }
    }
}

/// Called when a child session comes up, so the client UI can show it.
pub type SessionRegistrationHook = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

// ─── Internal Records ─────────────────────────────────────────────────────

/// Tracks a spawned child agent and its relationship to a parent.
#[derive(Debug, Clone)]
struct ChildAgentRecord {
    agent_id: String,
    session_id: String,
    parent_agent_id: String,
    parent_session_id: String,
    task_id: String,
    #[allow(dead_code)]
    role: AgentRole,
    #[allow(dead_code)]
    provider: String,
    cwd: String,
}

/// Delegation group for wait_mode="after_all".
#[derive(Debug)]
struct DelegationGroup {
    group_id: String,
    parent_agent_id: String,
    parent_session_id: String,
    child_agent_ids: Vec<String>,
    completed_agent_ids: HashSet<String>,
    /// (agent_id, task_id) pairs, in completion order, for the group wake.
    completed: Vec<(String, String)>,
}

struct OrchestratorInner {
    /// agentId → record
    child_agents: HashMap<String, ChildAgentRecord>,
    /// agentId → sessionId
    agent_session_map: HashMap<String, String>,
    /// groupId → group
    delegation_groups: HashMap<String, DelegationGroup>,
    /// callerAgentId → current groupId (after_all mode)
    active_group_by_agent: HashMap<String, String>,
    /// agentId → stop flag for its report-file watcher
    watcher_stops: HashMap<String, Arc<AtomicBool>>,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    inner: Arc<RwLock<OrchestratorInner>>,
    config: OrchestratorConfig,
    manager: Arc<SessionManager>,
    agent_store: AgentStore,
    task_store: TaskStore,
    specialists: Arc<SpecialistRegistry>,
    tools: Arc<AgentTools>,
    event_bus: Arc<EventBus>,
    session_registration: RwLock<Option<SessionRegistrationHook>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        manager: Arc<SessionManager>,
        agent_store: AgentStore,
        task_store: TaskStore,
        specialists: Arc<SpecialistRegistry>,
        tools: Arc<AgentTools>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(OrchestratorInner {
                child_agents: HashMap::new(),
                agent_session_map: HashMap::new(),
                delegation_groups: HashMap::new(),
                active_group_by_agent: HashMap::new(),
                watcher_stops: HashMap::new(),
            })),
            config,
            manager,
            agent_store,
            task_store,
            specialists,
            tools,
            event_bus,
            session_registration: RwLock::new(None),
        }
    }

    /// Wire the client-side session registration hook (sidebar entries).
    pub async fn set_session_registration_hook(&self, hook: SessionRegistrationHook) {
        *self.session_registration.write().await = Some(hook);
    }

    /// Start the report listener. Tool-endpoint `report_to_parent` calls emit
    /// `REPORT_SUBMITTED`; this task routes them into completion handling.
    pub fn start(self: &Arc<Self>) {
        let orchestrator = self.clone();
        let mut rx = self.event_bus.watch();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.event_type != AgentEventType::ReportSubmitted {
                            continue;
                        }
                        let child_agent_id = event.agent_id.clone();
                        if let Err(e) =
                            orchestrator.handle_report_submitted(&child_agent_id).await
                        {
                            tracing::error!(
                                "[Orchestrator] report handling failed for {}: {}",
                                child_agent_id,
                                e
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[Orchestrator] report listener lagged {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// The session id registered for an agent, if any.
    pub async fn get_session_for_agent(&self, agent_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.agent_session_map.get(agent_id).cloned()
    }

    // ─── Delegation ───────────────────────────────────────────────────────

    /// Delegate a task to a freshly spawned child agent session.
    ///
    /// Returns to the caller before the child's prompt completes; the prompt
    /// runs detached, and its resolution (or failure) only triggers
    /// completion handling.
    pub async fn delegate_task_with_spawn(
        &self,
        params: DelegateWithSpawnParams,
    ) -> Result<ToolResult, ServerError> {
        // 1. Depth guard
        let caller = self.agent_store.get(&params.caller_agent_id).await?;
        let caller_depth = caller.as_ref().map(|a| a.delegation_depth()).unwrap_or(0);
        if caller_depth >= MAX_DELEGATION_DEPTH {
            return Ok(ToolResult::error(format!(
                "Cannot create sub-agent: maximum delegation depth ({}) reached. You are at depth {}. Please complete this task directly instead of delegating further.",
                MAX_DELEGATION_DEPTH, caller_depth
            )));
        }

        // 2. Specialist resolution (role name or specialist id)
        let specialist = match self.specialists.resolve(&params.specialist).await {
            Some(s) => s,
            None => {
                return Ok(ToolResult::error(format!(
                    "Unknown specialist: {}. Use CRAFTER, GATE, DEVELOPER, or a specialist id.",
                    params.specialist
                )));
            }
        };

        // 3. Task lookup, with a hint that tells names apart from UUIDs
        let task = match self.task_store.get(&params.task_id).await? {
            Some(t) => t,
            None => {
                return Ok(ToolResult::error(task_not_found_hint(&params.task_id)));
            }
        };

        // 4. Provider and cwd defaulting
        let provider = params.provider.clone().unwrap_or_else(|| {
            if specialist.role == AgentRole::Crafter {
                self.config.default_crafter_provider.clone()
            } else {
                self.config.default_gate_provider.clone()
            }
        });
        let cwd = params.cwd.clone().unwrap_or_else(|| self.config.default_cwd.clone());

        // 5. Child agent record with depth metadata
        let agent_id = uuid::Uuid::new_v4().to_string();
        let agent_name = format!(
            "{}-{}",
            specialist.id,
            task.title
                .chars()
                .take(30)
                .collect::<String>()
                .replace(' ', "-")
                .to_lowercase()
        );
        let mut metadata = HashMap::new();
        metadata.insert(
            META_DELEGATION_DEPTH.to_string(),
            (caller_depth + 1).to_string(),
        );
        metadata.insert(META_CREATED_BY.to_string(), params.caller_agent_id.clone());
        metadata.insert(META_SPECIALIST.to_string(), specialist.id.clone());

        let agent = Agent::new(
            agent_id.clone(),
            agent_name.clone(),
            specialist.role.clone(),
            params.workspace_id.clone(),
            Some(params.caller_agent_id.clone()),
            Some(specialist.default_model_tier.clone()),
            Some(metadata),
        );
        self.agent_store.save(&agent).await?;

        // 6. Initial prompt
        let delegation_prompt = build_delegation_prompt(
            &specialist,
            &agent_id,
            &task,
            &params.caller_agent_id,
            params.additional_instructions.as_deref(),
        );

        // 7. Assign the task
        let patch = TaskPatch {
            status: Some(TaskStatus::InProgress),
            assigned_to: Some(agent_id.clone()),
            ..Default::default()
        };
        self.task_store
            .atomic_update(&params.task_id, task.version, patch)
            .await?;
        self.agent_store
            .update_status(&agent_id, &AgentStatus::Active)
            .await?;

        // 8. Spawn the child session
        let child_session_id = uuid::Uuid::new_v4().to_string();
        let spawn_result = self
            .manager
            .create_session(
                &child_session_id,
                &cwd,
                &params.workspace_id,
                CreateSessionOptions {
                    provider: Some(provider.clone()),
                    role: Some(specialist.role.as_str().to_string()),
                    model: specialist.model.clone(),
                    agent_id: Some(agent_id.clone()),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = spawn_result {
            // Roll back: agent ERROR, task BLOCKED
            self.agent_store
                .update_status(&agent_id, &AgentStatus::Error)
                .await?;
            if let Some(t) = self.task_store.get(&params.task_id).await? {
                let patch = TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    ..Default::default()
                };
                let _ = self.task_store.atomic_update(&t.id, t.version, patch).await;
            }
            return Ok(ToolResult::error(format!(
                "Failed to spawn agent process: {}",
                e
            )));
        }

        // 9. Register the record, wire the update forwarder and file watcher
        {
            let mut inner = self.inner.write().await;
            let record = ChildAgentRecord {
                agent_id: agent_id.clone(),
                session_id: child_session_id.clone(),
                parent_agent_id: params.caller_agent_id.clone(),
                parent_session_id: params.caller_session_id.clone(),
                task_id: params.task_id.clone(),
                role: specialist.role.clone(),
                provider: provider.clone(),
                cwd: cwd.clone(),
            };
            inner.child_agents.insert(agent_id.clone(), record);
            inner
                .agent_session_map
                .insert(agent_id.clone(), child_session_id.clone());

            // 11. after_all bookkeeping
            if params.wait_mode == "after_all" {
                let group_id = match inner.active_group_by_agent.get(&params.caller_agent_id) {
                    Some(gid) => gid.clone(),
                    None => {
                        let new_group_id = format!("delegation-group-{}", uuid::Uuid::new_v4());
                        inner
                            .active_group_by_agent
                            .insert(params.caller_agent_id.clone(), new_group_id.clone());
                        inner.delegation_groups.insert(
                            new_group_id.clone(),
                            DelegationGroup {
                                group_id: new_group_id.clone(),
                                parent_agent_id: params.caller_agent_id.clone(),
                                parent_session_id: params.caller_session_id.clone(),
                                child_agent_ids: Vec::new(),
                                completed_agent_ids: HashSet::new(),
                                completed: Vec::new(),
                            },
                        );
                        new_group_id
                    }
                };
                if let Some(group) = inner.delegation_groups.get_mut(&group_id) {
                    group.child_agent_ids.push(agent_id.clone());
                }
            }
        }

        if let Some(hook) = self.session_registration.read().await.as_ref() {
            hook(&child_session_id, &agent_id, specialist.role.as_str());
        }

        self.spawn_child_update_forwarder(
            &agent_id,
            &child_session_id,
            &params.caller_session_id,
        )
        .await;
        self.start_report_file_watcher(&agent_id, &cwd).await;

        // 10. Fire the prompt without awaiting it
        {
            let manager = self.manager.clone();
            let orchestrator_inner = self.inner.clone();
            let tools = self.tools.clone();
            let agent_store = self.agent_store.clone();
            let child_agent_id = agent_id.clone();
            let child_sid = child_session_id.clone();
            let task_id = params.task_id.clone();
            let this = self.clone_refs();
            tokio::spawn(async move {
                match manager.prompt(&child_sid, &delegation_prompt).await {
                    Ok(_) => {
                        auto_report_if_needed(
                            orchestrator_inner,
                            tools,
                            agent_store,
                            child_agent_id,
                            task_id,
                        )
                        .await;
                    }
                    Err(e) => {
                        this.handle_child_error(&child_agent_id, &e.to_string()).await;
                    }
                }
            });
        }

        // 12. Announce the assignment
        self.event_bus
            .emit(AgentEvent {
                event_type: AgentEventType::TaskAssigned,
                agent_id: agent_id.clone(),
                workspace_id: params.workspace_id.clone(),
                data: serde_json::json!({
                    "taskId": params.task_id,
                    "callerAgentId": params.caller_agent_id,
                    "taskTitle": task.title,
                    "provider": provider,
                    "specialist": specialist.id,
                }),
                timestamp: Utc::now(),
            })
            .await;

        let wait_message = if params.wait_mode == "after_all" {
            "You will be notified when ALL delegated agents in this group complete."
        } else {
            "You will be notified when this agent completes."
        };

        tracing::info!(
            "[Orchestrator] Delegated task \"{}\" to {} agent {} (provider: {})",
            task.title,
            specialist.name,
            agent_id,
            provider
        );

        Ok(ToolResult::success(serde_json::json!({
            "agentId": agent_id,
            "taskId": params.task_id,
            "agentName": agent_name,
            "specialist": specialist.id,
            "provider": provider,
            "sessionId": child_session_id,
            "waitMode": params.wait_mode,
            "message": format!("Task \"{}\" delegated to {} agent. {}", task.title, specialist.name, wait_message),
        })))
    }

    /// Cheap handle for detached tasks.
    fn clone_refs(&self) -> OrchestratorRefs {
        OrchestratorRefs {
            inner: self.inner.clone(),
            manager: self.manager.clone(),
            agent_store: self.agent_store.clone(),
            task_store: self.task_store.clone(),
            event_bus: self.event_bus.clone(),
        }
    }

    // ─── Child Update Forwarding ──────────────────────────────────────────

    /// Relay each raw child update onto the parent's streaming channel,
    /// tagged with the child's ids and with the outer session id rewritten to
    /// the parent's. Completion markers additionally schedule an auto-report
    /// check for providers that end their stream without reporting.
    async fn spawn_child_update_forwarder(
        &self,
        child_agent_id: &str,
        child_session_id: &str,
        parent_session_id: &str,
    ) {
        let mut rx = match self.manager.subscribe(child_session_id).await {
            Some(rx) => rx,
            None => {
                tracing::warn!(
                    "[Orchestrator] no notification channel for child session {}",
                    child_session_id
                );
                return;
            }
        };
        let parent_tx = self.manager.notification_sender(parent_session_id).await;
        let inner = self.inner.clone();
        let tools = self.tools.clone();
        let agent_store = self.agent_store.clone();
        let child_aid = child_agent_id.to_string();
        let child_sid = child_session_id.to_string();
        let parent_sid = parent_session_id.to_string();

        tokio::spawn(async move {
            loop {
                let msg = match rx.recv().await {
                    Ok(msg) => msg,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if msg.get("method").and_then(|m| m.as_str()) != Some("session/update") {
                    continue;
                }

                let kind = msg
                    .pointer("/params/update/sessionUpdate")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();

                // Relay to the parent's stream, tagged with the child's ids.
                if let Some(parent_tx) = &parent_tx {
                    let mut forwarded = msg.clone();
                    if let Some(params) = forwarded.get_mut("params") {
                        params["sessionId"] = serde_json::Value::String(parent_sid.clone());
                        params["childAgentId"] = serde_json::Value::String(child_aid.clone());
                        params["childSessionId"] = serde_json::Value::String(child_sid.clone());
                    }
                    let _ = parent_tx.send(forwarded);
                }

                if kind == "completed" || kind == "ended" {
                    let record = {
                        let inner_guard = inner.read().await;
                        inner_guard.child_agents.get(&child_aid).cloned()
                    };
                    if let Some(record) = record {
                        auto_report_if_needed(
                            inner.clone(),
                            tools.clone(),
                            agent_store.clone(),
                            child_aid.clone(),
                            record.task_id.clone(),
                        )
                        .await;
                    }
                }
            }
        });
    }

    // ─── Report-File Fallback ─────────────────────────────────────────────

    /// Some subprocess providers write `.report_to_parent_*.json` files in
    /// their cwd instead of calling the tool. Poll-watch the directory; on a
    /// match, replay the file through the tool endpoint and delete it.
    async fn start_report_file_watcher(&self, child_agent_id: &str, cwd: &str) {
        let stop = Arc::new(AtomicBool::new(false));
        self.inner
            .write()
            .await
            .watcher_stops
            .insert(child_agent_id.to_string(), stop.clone());

        let tools = self.tools.clone();
        let agent_id = child_agent_id.to_string();
        let dir = std::path::PathBuf::from(cwd);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tick.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !name.starts_with(".report_to_parent_") || !name.ends_with(".json") {
                        continue;
                    }
                    let path = entry.path();
                    let content = match tokio::fs::read_to_string(&path).await {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!("[Orchestrator] cannot read {:?}: {}", path, e);
                            continue;
                        }
                    };
                    match serde_json::from_str::<CompletionReport>(&content) {
                        Ok(report) => {
                            tracing::info!(
                                "[Orchestrator] report file {:?} for agent {}",
                                path,
                                agent_id
                            );
                            // Rejection because the child already completed
                            // counts as success; the file is consumed either way.
                            if let Err(e) = tools.report_to_parent(&agent_id, report).await {
                                tracing::warn!(
                                    "[Orchestrator] report file replay failed: {}",
                                    e
                                );
                            }
                            let _ = tokio::fs::remove_file(&path).await;
                            stop.store(true, Ordering::SeqCst);
                        }
                        Err(e) => {
                            tracing::warn!("[Orchestrator] bad report file {:?}: {}", path, e);
                            let _ = tokio::fs::remove_file(&path).await;
                        }
                    }
                }
            }
        });
    }

    // ─── Completion Handling ──────────────────────────────────────────────

    /// Route a submitted report into completion handling. Reports from
    /// unknown children (already handled, or never ours) are ignored.
    pub async fn handle_report_submitted(&self, child_agent_id: &str) -> Result<(), ServerError> {
        let record = {
            let mut inner = self.inner.write().await;
            let record = inner.child_agents.remove(child_agent_id);
            if record.is_some() {
                inner.agent_session_map.remove(child_agent_id);
                if let Some(stop) = inner.watcher_stops.remove(child_agent_id) {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            record
        };

        let record = match record {
            Some(r) => r,
            None => {
                tracing::debug!(
                    "[Orchestrator] Report from unknown child agent {}, ignoring",
                    child_agent_id
                );
                return Ok(());
            }
        };

        self.handle_child_completion(child_agent_id, &record).await
    }

    /// Child failed: agent ERROR, task NEEDS_FIX, parent still woken.
    pub async fn handle_child_error(&self, child_agent_id: &str, error: &str) {
        tracing::error!(
            "[Orchestrator] Child agent {} failed: {}",
            child_agent_id,
            error
        );

        if let Err(e) = self
            .agent_store
            .update_status(child_agent_id, &AgentStatus::Error)
            .await
        {
            tracing::error!("[Orchestrator] status update failed: {}", e);
        }

        let record = {
            let mut inner = self.inner.write().await;
            let record = inner.child_agents.remove(child_agent_id);
            if record.is_some() {
                inner.agent_session_map.remove(child_agent_id);
                if let Some(stop) = inner.watcher_stops.remove(child_agent_id) {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            record
        };
        let record = match record {
            Some(r) => r,
            None => return,
        };

        if let Ok(Some(task)) = self.task_store.get(&record.task_id).await {
            let patch = TaskPatch {
                status: Some(TaskStatus::NeedsFix),
                completion_summary: Some(error.to_string()),
                ..Default::default()
            };
            if let Err(e) = self
                .task_store
                .atomic_update(&task.id, task.version, patch)
                .await
            {
                tracing::error!("[Orchestrator] task update failed: {}", e);
            }
        }

        let workspace_id = self
            .agent_store
            .get(child_agent_id)
            .await
            .ok()
            .flatten()
            .map(|a| a.workspace_id)
            .unwrap_or_default();
        self.event_bus
            .emit(AgentEvent {
                event_type: AgentEventType::AgentError,
                agent_id: child_agent_id.to_string(),
                workspace_id,
                data: serde_json::json!({ "error": error }),
                timestamp: Utc::now(),
            })
            .await;

        // The error report substitutes for the success report: the parent is
        // woken through the same pathway.
        if let Err(e) = self.handle_child_completion(child_agent_id, &record).await {
            tracing::error!("[Orchestrator] completion handling failed: {}", e);
        }
    }

    /// Group bookkeeping or immediate wake. The caller has already removed
    /// the child's record, so a second completion for the same child is a
    /// no-op upstream.
    async fn handle_child_completion(
        &self,
        child_agent_id: &str,
        record: &ChildAgentRecord,
    ) -> Result<(), ServerError> {
        let mut inner = self.inner.write().await;

        let mut group_complete = None;
        let mut in_group = false;
        for (group_id, group) in inner.delegation_groups.iter_mut() {
            if !group.child_agent_ids.contains(&child_agent_id.to_string()) {
                continue;
            }
            in_group = true;
            if group.completed_agent_ids.insert(child_agent_id.to_string()) {
                group
                    .completed
                    .push((child_agent_id.to_string(), record.task_id.clone()));
            }
            tracing::info!(
                "[Orchestrator] Agent {} completed in group {} ({}/{})",
                child_agent_id,
                group_id,
                group.completed_agent_ids.len(),
                group.child_agent_ids.len()
            );
            if group.completed_agent_ids.len() >= group.child_agent_ids.len() {
                group_complete = Some(group_id.clone());
            }
            break;
        }

        if let Some(group) = group_complete.and_then(|gid| inner.delegation_groups.remove(&gid)) {
            inner.active_group_by_agent.remove(&group.parent_agent_id);
            drop(inner);

            tracing::info!(
                "[Orchestrator] All agents in group {} completed, waking parent",
                group.group_id
            );
            self.wake_parent_with_group(&group).await;
        } else if !in_group {
            drop(inner);
            tracing::info!(
                "[Orchestrator] Child agent {} completed, waking parent {}",
                child_agent_id,
                record.parent_agent_id
            );
            self.wake_parent(record).await;
        }
        // A group member that is not the last one: no wake.

        Ok(())
    }

    // ─── Wake Protocol ────────────────────────────────────────────────────

    /// Wake the parent for a single child completion.
    async fn wake_parent(&self, record: &ChildAgentRecord) {
        let agent = self.agent_store.get(&record.agent_id).await.ok().flatten();
        let task = self.task_store.get(&record.task_id).await.ok().flatten();

        self.send_task_completion_update(&record.parent_session_id, record, task.as_ref())
            .await;

        let mut wake_message = String::from("## Agent Completion Report\n\n");
        if let Some(agent) = &agent {
            wake_message.push_str(&format!(
                "**Agent:** {} ({})\n",
                agent.name,
                agent.role.as_str()
            ));
        } else {
            wake_message.push_str(&format!("**Agent:** {}\n", record.agent_id));
        }
        if let Some(task) = &task {
            wake_message.push_str(&format!(
                "**Task:** \"{}\" → {}\n",
                task.title,
                task.status.as_str()
            ));
            if let Some(summary) = &task.completion_summary {
                wake_message.push_str(&format!("**Summary:** {}\n", summary));
            }
            if let Some(verdict) = &task.verification_verdict {
                wake_message.push_str(&format!("**Verdict:** {}\n", verdict.as_str()));
            }
            if let Some(report) = &task.verification_report {
                wake_message.push_str(&format!("**Verification Report:** {}\n", report));
            }
        } else {
            wake_message.push_str(&format!("**Task:** {}\n", record.task_id));
        }
        wake_message.push_str("\nReview the results and decide next steps.");

        self.send_prompt_to_session(&record.parent_session_id, &wake_message)
            .await;
    }

    /// Wake the parent once for a completed after_all group.
    async fn wake_parent_with_group(&self, group: &DelegationGroup) {
        let mut wake_message = format!(
            "## Delegation Group Complete\n\nAll {} delegated agents have completed:\n",
            group.child_agent_ids.len()
        );
        for (agent_id, task_id) in &group.completed {
            let agent = self.agent_store.get(agent_id).await.ok().flatten();
            let task = self.task_store.get(task_id).await.ok().flatten();
            let name = agent
                .as_ref()
                .map(|a| format!("{} ({})", a.name, a.role.as_str()))
                .unwrap_or_else(|| agent_id.clone());
            match task {
                Some(task) => {
                    wake_message.push_str(&format!(
                        "- {} — Task \"{}\" → {}{}\n",
                        name,
                        task.title,
                        task.status.as_str(),
                        task.completion_summary
                            .as_ref()
                            .map(|s| format!(": {}", s))
                            .unwrap_or_default()
                    ));
                }
                None => wake_message.push_str(&format!("- {} — Task {}\n", name, task_id)),
            }
        }
        wake_message.push_str(
            "\nReview the results and decide next steps.\nYou may want to delegate a GATE (verifier) agent to validate the work.",
        );

        self.send_prompt_to_session(&group.parent_session_id, &wake_message)
            .await;
    }

    /// Synthetic `task_completion` update on the parent's stream, ahead of
    /// the wake prompt.
    async fn send_task_completion_update(
        &self,
        parent_session_id: &str,
        record: &ChildAgentRecord,
        task: Option<&Task>,
    ) {
        if let Some(tx) = self.manager.notification_sender(parent_session_id).await {
            let notification = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": parent_session_id,
                    "childAgentId": record.agent_id,
                    "childSessionId": record.session_id,
                    "update": {
                        "sessionUpdate": "task_completion",
                        "taskId": record.task_id,
                        "taskTitle": task.map(|t| t.title.clone()),
                        "status": task.map(|t| t.status.as_str()),
                    }
                }
            });
            let _ = tx.send(notification);
        }
    }

    /// Dispatch a wake prompt via the parent's adapter. Failures are logged,
    /// never propagated: the child's completion already happened.
    async fn send_prompt_to_session(&self, session_id: &str, message: &str) {
        if let Err(e) = self.manager.prompt(session_id, message).await {
            tracing::error!(
                "[Orchestrator] Failed to wake parent session {}: {}",
                session_id,
                e
            );
        }
    }

    // ─── Cancellation & Cleanup ───────────────────────────────────────────

    /// Cooperative cancel of a session and every child under it.
    pub async fn cancel_with_children(&self, session_id: &str) {
        self.manager.cancel(session_id).await;
        let child_sessions: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .child_agents
                .values()
                .filter(|r| r.parent_session_id == session_id)
                .map(|r| r.session_id.clone())
                .collect()
        };
        for sid in child_sessions {
            self.manager.cancel(&sid).await;
        }
    }

    /// Kill child sessions tied to a closing session and release their records.
    pub async fn cleanup(&self, session_id: &str) {
        let to_remove: Vec<(String, String)> = {
            let inner = self.inner.read().await;
            inner
                .child_agents
                .values()
                .filter(|r| r.parent_session_id == session_id || r.session_id == session_id)
                .map(|r| (r.agent_id.clone(), r.session_id.clone()))
                .collect()
        };

        for (agent_id, child_session_id) in to_remove {
            self.manager.kill_session(&child_session_id).await;
            let mut inner = self.inner.write().await;
            inner.child_agents.remove(&agent_id);
            inner.agent_session_map.remove(&agent_id);
            if let Some(stop) = inner.watcher_stops.remove(&agent_id) {
                stop.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Store handles for detached error paths.
struct OrchestratorRefs {
    inner: Arc<RwLock<OrchestratorInner>>,
    manager: Arc<SessionManager>,
    agent_store: AgentStore,
    task_store: TaskStore,
    event_bus: Arc<EventBus>,
}

impl OrchestratorRefs {
    async fn handle_child_error(&self, child_agent_id: &str, error: &str) {
        tracing::error!(
            "[Orchestrator] Failed to send initial prompt to agent {}: {}",
            child_agent_id,
            error
        );

        let record = {
            let mut inner = self.inner.write().await;
            let record = inner.child_agents.remove(child_agent_id);
            if record.is_some() {
                inner.agent_session_map.remove(child_agent_id);
                if let Some(stop) = inner.watcher_stops.remove(child_agent_id) {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            record
        };
        let record = match record {
            Some(r) => r,
            None => return,
        };

        let _ = self
            .agent_store
            .update_status(child_agent_id, &AgentStatus::Error)
            .await;
        if let Ok(Some(task)) = self.task_store.get(&record.task_id).await {
            let patch = TaskPatch {
                status: Some(TaskStatus::NeedsFix),
                completion_summary: Some(error.to_string()),
                ..Default::default()
            };
            let _ = self
                .task_store
                .atomic_update(&task.id, task.version, patch)
                .await;
        }
        self.event_bus
            .emit(AgentEvent {
                event_type: AgentEventType::AgentError,
                agent_id: child_agent_id.to_string(),
                workspace_id: String::new(),
                data: serde_json::json!({ "error": error }),
                timestamp: Utc::now(),
            })
            .await;

        // Wake the parent with whatever state the task is in now.
        let wake = format!(
            "## Agent Completion Report\n\n**Agent:** {}\n**Task:** {} → NEEDS_FIX\n**Summary:** {}\n\nReview the results and decide next steps.",
            child_agent_id, record.task_id, error
        );
        if let Err(e) = self.manager.prompt(&record.parent_session_id, &wake).await {
            tracing::error!(
                "[Orchestrator] Failed to wake parent session {}: {}",
                record.parent_session_id,
                e
            );
        }
    }
}

/// After a child's prompt resolves (or its stream ends) without a report,
/// give it a short settle window, then synthesize a success report through
/// the tool endpoint.
async fn auto_report_if_needed(
    inner: Arc<RwLock<OrchestratorInner>>,
    tools: Arc<AgentTools>,
    agent_store: AgentStore,
    child_agent_id: String,
    task_id: String,
) {
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    // A processed report removes the record; nothing left to do.
    if !inner.read().await.child_agents.contains_key(&child_agent_id) {
        return;
    }
    match agent_store.get(&child_agent_id).await {
        Ok(Some(agent)) if agent.status == AgentStatus::Completed => return,
        Ok(Some(_)) => {}
        _ => return,
    }

    tracing::info!(
        "[Orchestrator] Auto-reporting for agent {} (no report_to_parent call)",
        child_agent_id
    );
    let report = CompletionReport {
        task_id: Some(task_id),
        summary: "Agent completed its work (auto-reported by orchestrator).".to_string(),
        success: true,
        files_modified: None,
        verification_results: None,
    };
    if let Err(e) = tools.report_to_parent(&child_agent_id, report).await {
        tracing::error!("[Orchestrator] auto-report failed: {}", e);
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────

/// A UUID-shaped string: 36 chars, hyphens at the canonical positions, hex
/// everywhere else.
fn looks_like_uuid(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    s.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}

/// Error text for a missing task, hinting at the likely mistake: a
/// name-shaped id means the caller never created the task.
fn task_not_found_hint(task_id: &str) -> String {
    if looks_like_uuid(task_id) {
        format!(
            "Task not found: {}. Use list_tasks to see existing tasks, or create_task to create one.",
            task_id
        )
    } else {
        format!(
            "Task not found: \"{}\" looks like a task name, not a UUID. Use create_task to create the task first, or convert_task_blocks to materialize tasks from the spec note, then delegate with the returned task id.",
            task_id
        )
    }
}

/// Build the initial prompt for a delegated agent.
fn build_delegation_prompt(
    specialist: &Specialist,
    agent_id: &str,
    task: &Task,
    parent_agent_id: &str,
    additional_context: Option<&str>,
) -> String {
    let mut prompt = format!("{}\n\n---\n\n", specialist.system_prompt);
    prompt.push_str(&format!("**Your Agent ID:** {}\n", agent_id));
    prompt.push_str(&format!("**Your Parent Agent ID:** {}\n", parent_agent_id));
    prompt.push_str(&format!("**Task ID:** {}\n\n", task.id));
    prompt.push_str(&format!("# Task: {}\n\n", task.title));
    prompt.push_str(&format!("## Objective\n{}\n", task.objective));

    if let Some(scope) = &task.scope {
        prompt.push_str(&format!("\n## Scope\n{}\n", scope));
    }

    if let Some(criteria) = &task.acceptance_criteria {
        prompt.push_str("\n## Definition of Done\n");
        for c in criteria {
            prompt.push_str(&format!("- {}\n", c));
        }
    }

    if let Some(commands) = &task.verification_commands {
        prompt.push_str("\n## Verification\n");
        for c in commands {
            prompt.push_str(&format!("- `{}`\n", c));
        }
    }

    prompt.push_str(&format!("\n---\n**Reminder:** {}\n", specialist.role_reminder));

    if let Some(ctx) = additional_context {
        prompt.push_str(&format!("\n**Additional Context:** {}\n", ctx));
    }

    prompt.push_str(
        "\n**SCOPE: Complete THIS task only.** When done, call `report_to_parent` with your results.",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EventBridge;
    use crate::db::Database;
    use crate::store::{AcpSessionStore, ConversationStore, NoteStore, SpecialistStore};

    fn test_orchestrator() -> (Arc<Orchestrator>, AgentStore, TaskStore) {
        let db = Database::open_in_memory().expect("in-memory db");
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workspaces (id, title, status, metadata, created_at, updated_at)
                 VALUES ('default', 'Default', 'active', '{}', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .expect("seed default workspace");
        let agent_store = AgentStore::new(db.clone());
        let task_store = TaskStore::new(db.clone());
        let bridge = Arc::new(EventBridge::new());
        let manager = Arc::new(SessionManager::new(
            AcpSessionStore::new(db.clone()),
            bridge,
        ));
        let event_bus = Arc::new(EventBus::new());
        let tools = Arc::new(AgentTools::new(
            agent_store.clone(),
            ConversationStore::new(db.clone()),
            task_store.clone(),
            NoteStore::new(db.clone()),
            event_bus.clone(),
        ));
        let specialists = Arc::new(SpecialistRegistry::with_dirs(
            SpecialistStore::new(db.clone()),
            Vec::new(),
            None,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            manager,
            agent_store.clone(),
            task_store.clone(),
            specialists,
            tools,
            event_bus,
        ));
        (orchestrator, agent_store, task_store)
    }

    fn params(task_id: &str, caller: &str) -> DelegateWithSpawnParams {
        DelegateWithSpawnParams {
            task_id: task_id.to_string(),
            caller_agent_id: caller.to_string(),
            caller_session_id: "parent-session".to_string(),
            workspace_id: "default".to_string(),
            specialist: "CRAFTER".to_string(),
            provider: None,
            cwd: None,
            additional_instructions: None,
            wait_mode: "immediate".to_string(),
        }
    }

    async fn save_agent_at_depth(store: &AgentStore, id: &str, depth: u32) {
        let mut metadata = HashMap::new();
        metadata.insert(META_DELEGATION_DEPTH.to_string(), depth.to_string());
        let agent = Agent::new(
            id.to_string(),
            format!("agent-{}", id),
            AgentRole::Routa,
            "default".to_string(),
            None,
            None,
            Some(metadata),
        );
        store.save(&agent).await.unwrap();
    }

    #[tokio::test]
    async fn depth_guard_rejects_at_max_depth() {
        let (orchestrator, agent_store, _) = test_orchestrator();
        save_agent_at_depth(&agent_store, "deep-agent", 2).await;

        let result = orchestrator
            .delegate_task_with_spawn(params("some-task", "deep-agent"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Cannot create sub-agent: maximum delegation depth (2) reached. You are at depth 2. Please complete this task directly instead of delegating further.")
        );
    }

    #[tokio::test]
    async fn unknown_specialist_is_rejected() {
        let (orchestrator, agent_store, _) = test_orchestrator();
        save_agent_at_depth(&agent_store, "caller", 0).await;

        let mut p = params("some-task", "caller");
        p.specialist = "WIZARD".to_string();
        let result = orchestrator.delegate_task_with_spawn(p).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Unknown specialist: WIZARD"));
    }

    #[tokio::test]
    async fn missing_task_hint_discriminates_names_from_uuids() {
        let (orchestrator, agent_store, _) = test_orchestrator();
        save_agent_at_depth(&agent_store, "caller", 0).await;

        // Name-shaped id: points at create_task / convert_task_blocks.
        let result = orchestrator
            .delegate_task_with_spawn(params("openspec-ts-enhance-parser", "caller"))
            .await
            .unwrap();
        let err = result.error.unwrap();
        assert!(err.contains("looks like a task name, not a UUID"));
        assert!(err.contains("create_task"));
        assert!(err.contains("convert_task_blocks"));

        // UUID-shaped id: points at list_tasks, no name hint.
        let result = orchestrator
            .delegate_task_with_spawn(params("3f8b2c1a-9d4e-4f6a-8b2c-1a9d4e4f6a8b", "caller"))
            .await
            .unwrap();
        let err = result.error.unwrap();
        assert!(!err.contains("looks like a task name"));
        assert!(err.contains("list_tasks"));
    }

    #[test]
    fn uuid_shape_detection() {
        assert!(looks_like_uuid("3f8b2c1a-9d4e-4f6a-8b2c-1a9d4e4f6a8b"));
        assert!(!looks_like_uuid("openspec-ts-enhance-parser"));
        assert!(!looks_like_uuid("EnhanceParser"));
        assert!(!looks_like_uuid("3f8b2c1a-9d4e-4f6a-8b2c"));
    }

    #[tokio::test]
    async fn after_all_group_wakes_exactly_once() {
        let (orchestrator, agent_store, task_store) = test_orchestrator();

        // Register three children directly in a group, bypassing the spawn path.
        let group_id = "delegation-group-test".to_string();
        {
            let mut inner = orchestrator.inner.write().await;
            let mut group = DelegationGroup {
                group_id: group_id.clone(),
                parent_agent_id: "parent".to_string(),
                parent_session_id: "parent-session".to_string(),
                child_agent_ids: Vec::new(),
                completed_agent_ids: HashSet::new(),
                completed: Vec::new(),
            };
            for i in 0..3 {
                let agent_id = format!("child-{}", i);
                let task_id = format!("task-{}", i);
                group.child_agent_ids.push(agent_id.clone());
                inner.child_agents.insert(
                    agent_id.clone(),
                    ChildAgentRecord {
                        agent_id: agent_id.clone(),
                        session_id: format!("session-{}", i),
                        parent_agent_id: "parent".to_string(),
                        parent_session_id: "parent-session".to_string(),
                        task_id,
                        role: AgentRole::Crafter,
                        provider: "opencode".to_string(),
                        cwd: ".".to_string(),
                    },
                );
            }
            inner.delegation_groups.insert(group_id.clone(), group);
            inner
                .active_group_by_agent
                .insert("parent".to_string(), group_id.clone());
        }

        for i in 0..3 {
            let agent = Agent::new(
                format!("child-{}", i),
                format!("crafter-{}", i),
                AgentRole::Crafter,
                "default".to_string(),
                Some("parent".to_string()),
                None,
                None,
            );
            agent_store.save(&agent).await.unwrap();
            let task = Task::new(
                format!("task-{}", i),
                format!("T{}", i),
                "objective".to_string(),
                "default".to_string(),
                None,
                None,
                None,
                None,
                None,
                None,
            );
            task_store.save(&task).await.unwrap();
        }

        // Complete all three in arbitrary order. The wake prompt itself fails
        // (no live parent session) but bookkeeping must still resolve.
        for i in [1, 0, 2] {
            orchestrator
                .handle_report_submitted(&format!("child-{}", i))
                .await
                .unwrap();
        }

        let inner = orchestrator.inner.read().await;
        assert!(inner.delegation_groups.is_empty());
        assert!(inner.active_group_by_agent.is_empty());
        assert!(inner.child_agents.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_rolls_back_but_keeps_depth_metadata() {
        let (orchestrator, agent_store, task_store) = test_orchestrator();
        save_agent_at_depth(&agent_store, "caller", 1).await;

        let task = Task::new(
            "task-1".to_string(),
            "Add hello".to_string(),
            "Add hello.txt".to_string(),
            "default".to_string(),
            None,
            None,
            None,
            None,
            None,
            None,
        );
        task_store.save(&task).await.unwrap();

        // No provider binary exists in the test environment, so the session
        // spawn fails after the child agent row was created.
        let mut p = params("task-1", "caller");
        p.provider = Some("definitely-not-installed".to_string());
        let result = orchestrator.delegate_task_with_spawn(p).await.unwrap();
        assert!(!result.success);

        // The child agent exists at depth caller+1, marked ERROR.
        let children = agent_store.list_by_parent("caller").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].delegation_depth(), 2);
        assert_eq!(children[0].status, AgentStatus::Error);
        assert_eq!(
            children[0].metadata.get(META_CREATED_BY).map(|s| s.as_str()),
            Some("caller")
        );

        // The task rolled back to BLOCKED.
        let task = task_store.get("task-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.assigned_to.as_deref(), Some(children[0].id.as_str()));
    }

    #[tokio::test]
    async fn duplicate_report_is_ignored() {
        let (orchestrator, _, _) = test_orchestrator();
        // Unknown child: nothing happens, no error.
        orchestrator
            .handle_report_submitted("never-registered")
            .await
            .unwrap();
    }
}
