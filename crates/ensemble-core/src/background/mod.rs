//! Background task engine.
//!
//! Drains the persistent priority+dependency queue: reserves ready tasks,
//! spawns detached agent sessions for them (no client stream), mirrors
//! bridge events into progress columns, and retries or fails tasks whose
//! sessions never materialize.
//!
//! Reservation is the store's atomic PENDING→RUNNING flip; orphan re-claims
//! run on the same tick loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::acp::{CreateSessionOptions, SessionManager};
use crate::bridge::{AgentEvent, EventBridge};
use crate::error::ServerError;
use crate::models::background_task::{BackgroundTask, BackgroundTaskStatus};
use crate::store::BackgroundTaskStore;
use crate::workflow::WorkflowRunner;

/// Engine configuration, sourced from the environment by the server.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// RUNNING tasks without a session older than this are re-claimed.
    pub orphan_threshold_minutes: i64,
    /// Queue poll cadence.
    pub tick_seconds: u64,
    /// Working directory for detached sessions.
    pub default_cwd: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orphan_threshold_minutes: std::env::var("ORPHAN_THRESHOLD_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            tick_seconds: 2,
            default_cwd: ".".to_string(),
        }
    }
}

pub struct BackgroundTaskEngine {
    store: BackgroundTaskStore,
    manager: Arc<SessionManager>,
    bridge: Arc<EventBridge>,
    workflow_runner: Arc<WorkflowRunner>,
    config: EngineConfig,
    running: AtomicBool,
}

impl BackgroundTaskEngine {
    pub fn new(
        store: BackgroundTaskStore,
        manager: Arc<SessionManager>,
        bridge: Arc<EventBridge>,
        workflow_runner: Arc<WorkflowRunner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            manager,
            bridge,
            workflow_runner,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Start the tick loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(engine.config.tick_seconds));
            tracing::info!(
                "[BackgroundEngine] started (orphan threshold: {} min)",
                engine.config.orphan_threshold_minutes
            );
            loop {
                tick.tick().await;
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = engine.tick().await {
                    tracing::error!("[BackgroundEngine] tick failed: {}", e);
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One scheduling pass: sweep orphans, then claim and launch every ready
    /// task. Launched tasks run detached.
    pub async fn tick(&self) -> Result<(), ServerError> {
        let (requeued, failed) = self
            .store
            .requeue_orphans(self.config.orphan_threshold_minutes)
            .await?;
        if requeued > 0 || failed > 0 {
            tracing::warn!(
                "[BackgroundEngine] orphan sweep: {} requeued, {} failed",
                requeued,
                failed
            );
        }

        while let Some(task) = self.store.claim_next_ready().await? {
            tracing::info!(
                "[BackgroundEngine] claimed task {} \"{}\" (attempt {}/{})",
                task.id,
                task.title,
                task.attempts,
                task.max_attempts
            );
            let engine = self.clone_refs();
            tokio::spawn(async move {
                engine.run_task(task).await;
            });
        }
        Ok(())
    }

    fn clone_refs(&self) -> EngineRefs {
        EngineRefs {
            store: self.store.clone(),
            manager: self.manager.clone(),
            bridge: self.bridge.clone(),
            workflow_runner: self.workflow_runner.clone(),
            default_cwd: self.config.default_cwd.clone(),
        }
    }

    /// Cancel a task: kill its session if one is live, then mark CANCELLED.
    pub async fn cancel(&self, task_id: &str) -> Result<(), ServerError> {
        if let Some(task) = self.store.get(task_id).await? {
            if let Some(session_id) = &task.result_session_id {
                self.manager.kill_session(session_id).await;
            }
            if !task.status.is_terminal() {
                self.store.mark_cancelled(task_id).await?;
            }
        }
        Ok(())
    }

    /// Put a failed task back on the queue with a fresh attempt budget.
    pub async fn retry(&self, task_id: &str) -> Result<(), ServerError> {
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Background task not found: {}", task_id)))?;
        task.status = BackgroundTaskStatus::Pending;
        task.error_message = None;
        task.started_at = None;
        task.completed_at = None;
        self.store.save(&task).await?;
        Ok(())
    }
}

struct EngineRefs {
    store: BackgroundTaskStore,
    manager: Arc<SessionManager>,
    bridge: Arc<EventBridge>,
    workflow_runner: Arc<WorkflowRunner>,
    default_cwd: String,
}

impl EngineRefs {
    /// Drive one claimed task to a terminal state (or back to PENDING for a
    /// retry). Mirrors an interactive session's lifecycle minus the client
    /// stream.
    async fn run_task(&self, task: BackgroundTask) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let created = self
            .manager
            .create_session(
                &session_id,
                &self.default_cwd,
                &task.workspace_id,
                CreateSessionOptions {
                    provider: Some(task.agent_id.clone()),
                    role: Some("DEVELOPER".to_string()),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = created {
            self.handle_failure(&task, &format!("session spawn failed: {}", e))
                .await;
            return;
        }
        if let Err(e) = self.store.set_result_session(&task.id, &session_id).await {
            tracing::error!("[BackgroundEngine] set_result_session failed: {}", e);
        }

        // Mirror bridge events into progress columns until the turn completes.
        let mut events = self.bridge.subscribe(&session_id).await;
        let store = self.store.clone();
        let task_id = task.id.clone();
        let progress_handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let result = match &event.event {
                    AgentEvent::ToolCallStarted { name, .. } => {
                        store
                            .update_progress(&task_id, Some(name), 1, 0, 0)
                            .await
                    }
                    AgentEvent::OutputChunk { .. } | AgentEvent::Thought { .. } => {
                        store.update_progress(&task_id, None, 0, 0, 0).await
                    }
                    AgentEvent::Completed { .. } | AgentEvent::Error { .. } => break,
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    tracing::warn!("[BackgroundEngine] progress write failed: {}", e);
                }
            }
        });

        let prompt_result = self.manager.prompt(&session_id, &task.prompt).await;
        progress_handle.abort();

        match prompt_result {
            Ok(result) => {
                let output = result
                    .get("content")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| result.to_string());
                let input_tokens = result
                    .pointer("/usage/inputTokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let output_tokens = result
                    .pointer("/usage/outputTokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                if input_tokens > 0 || output_tokens > 0 {
                    let _ = self
                        .store
                        .update_progress(&task.id, None, 0, input_tokens, output_tokens)
                        .await;
                }

                if let Err(e) = self.store.mark_completed(&task.id, Some(&output)).await {
                    tracing::error!("[BackgroundEngine] completion write failed: {}", e);
                }
                tracing::info!("[BackgroundEngine] task {} completed", task.id);

                if let (Some(run_id), Some(step_name)) =
                    (&task.workflow_run_id, &task.workflow_step_name)
                {
                    if let Err(e) = self
                        .workflow_runner
                        .record_step_result(run_id, step_name, &output)
                        .await
                    {
                        tracing::error!("[BackgroundEngine] workflow step record failed: {}", e);
                    }
                }
            }
            Err(e) => {
                self.handle_failure(&task, &e.to_string()).await;
            }
        }

        self.manager.kill_session(&session_id).await;
    }

    /// Retry while attempts remain; otherwise FAILED (and the owning workflow
    /// run fails with it).
    async fn handle_failure(&self, task: &BackgroundTask, error: &str) {
        tracing::error!("[BackgroundEngine] task {} failed: {}", task.id, error);
        if task.attempts < task.max_attempts {
            let mut retry = task.clone();
            retry.status = BackgroundTaskStatus::Pending;
            retry.error_message = Some(error.to_string());
            retry.started_at = None;
            retry.result_session_id = None;
            if let Err(e) = self.store.save(&retry).await {
                tracing::error!("[BackgroundEngine] requeue failed: {}", e);
            }
            return;
        }

        if let Err(e) = self.store.mark_failed(&task.id, error).await {
            tracing::error!("[BackgroundEngine] failure write failed: {}", e);
        }
        if let (Some(run_id), Some(step_name)) = (&task.workflow_run_id, &task.workflow_step_name)
        {
            if let Err(e) = self
                .workflow_runner
                .record_step_failure(run_id, step_name, error)
                .await
            {
                tracing::error!("[BackgroundEngine] workflow failure record failed: {}", e);
            }
        }
    }
}
