//! Session manager — owns the mapping from session ids to live adapters.
//!
//! At most one adapter exists per session id. The manager:
//!   - selects an adapter shape from the provider preset
//!   - runs start/initialize/new_session in order
//!   - persists the session row **before** returning, so a cold-started
//!     process can find it again
//!   - pipes every raw notification into the semantic bridge and the
//!     session history
//!
//! Per-session lifecycle: CONSTRUCTING → INITIALIZING → READY → ACTIVE
//! (prompt in flight) → READY | TERMINATED.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::bridge::EventBridge;
use crate::error::ServerError;
use crate::store::{AcpSessionRow, AcpSessionStore};

use super::sdk::{SdkAdapter, SdkConfig};
use super::stream_json::{StreamJsonConfig, StreamJsonProcess};
use super::{get_preset_by_id, is_sdk_provider, AdapterHandle, JsonRpcProcess, NotificationSender};

/// Options for `create_session`.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub provider: Option<String>,
    pub role: Option<String>,
    pub mode_id: Option<String>,
    pub model: Option<String>,
    /// Ensemble agent bound to this session, if any.
    pub agent_id: Option<String>,
    pub extra_args: Vec<String>,
    pub extra_env: HashMap<String, String>,
}

/// Construction phases happen inside `construct_adapter`, before the session
/// is registered; only the registered phases are observable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(dead_code)]
enum SessionPhase {
    Constructing,
    Initializing,
    Ready,
    Active,
    Terminated,
}

struct ManagedSession {
    handle: AdapterHandle,
    provider_session_id: String,
    provider: String,
    phase: SessionPhase,
    created_at: String,
}

/// Snapshot of a live session for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub provider_session_id: String,
    pub preset_id: String,
    pub alive: bool,
    pub phase: String,
    pub created_at: String,
}

/// Registry of live adapter sessions.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, ManagedSession>>>,
    notification_channels: Arc<RwLock<HashMap<String, NotificationSender>>>,
    session_store: AcpSessionStore,
    bridge: Arc<EventBridge>,
}

impl SessionManager {
    pub fn new(session_store: AcpSessionStore, bridge: Arc<EventBridge>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            notification_channels: Arc::new(RwLock::new(HashMap::new())),
            session_store,
            bridge,
        }
    }

    /// Create a new session: pick the adapter shape from the provider,
    /// establish it, persist the session row, and emit `Started`.
    ///
    /// Returns the provider-side session id.
    pub async fn create_session(
        &self,
        session_id: &str,
        cwd: &str,
        workspace_id: &str,
        opts: CreateSessionOptions,
    ) -> Result<String, ServerError> {
        let provider = opts.provider.clone().unwrap_or_else(|| "opencode".to_string());

        // Notification channel for this session; the ingest task feeds the
        // bridge and the history log until the channel closes.
        let (ntx, _) = broadcast::channel::<serde_json::Value>(256);
        self.spawn_ingest_task(session_id, &ntx);

        let (handle, provider_session_id) = self
            .construct_adapter(&provider, session_id, cwd, &opts, ntx.clone())
            .await?;

        // Persist before returning so cold-start recovery can see the session.
        let now = chrono::Utc::now().timestamp_millis();
        self.session_store
            .save(&AcpSessionRow {
                id: session_id.to_string(),
                name: None,
                cwd: cwd.to_string(),
                workspace_id: workspace_id.to_string(),
                routa_agent_id: opts.agent_id.clone(),
                provider: Some(provider.clone()),
                role: opts.role.clone(),
                mode_id: opts.mode_id.clone(),
                model: opts.model.clone(),
                first_prompt_sent: false,
                message_history: Vec::new(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.sessions.write().await.insert(
            session_id.to_string(),
            ManagedSession {
                handle,
                provider_session_id: provider_session_id.clone(),
                provider: provider.clone(),
                phase: SessionPhase::Ready,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.notification_channels
            .write()
            .await
            .insert(session_id.to_string(), ntx);

        self.bridge.emit_started(session_id).await;

        tracing::info!(
            "[SessionManager] Session {} created (provider: {}, provider session: {})",
            session_id,
            provider,
            provider_session_id,
        );

        Ok(provider_session_id)
    }

    /// Create an in-process session for a native workspace agent.
    pub async fn create_workspace_agent_session(
        &self,
        session_id: &str,
        cwd: &str,
        workspace_id: &str,
        mut opts: CreateSessionOptions,
    ) -> Result<String, ServerError> {
        opts.provider = Some("anthropic-api".to_string());
        self.create_session(session_id, cwd, workspace_id, opts).await
    }

    async fn construct_adapter(
        &self,
        provider: &str,
        session_id: &str,
        cwd: &str,
        opts: &CreateSessionOptions,
        ntx: NotificationSender,
    ) -> Result<(AdapterHandle, String), ServerError> {
        if is_sdk_provider(provider) {
            let mut config = SdkConfig::from_env()
                .ok_or_else(|| ServerError::AdapterUnavailable(provider.to_string()))?;
            if let Some(model) = &opts.model {
                config.model = model.clone();
            }
            let adapter = SdkAdapter::new(config, ntx, session_id);
            // In-process sessions use our id on both sides.
            return Ok((AdapterHandle::Sdk(Arc::new(adapter)), session_id.to_string()));
        }

        let preset = get_preset_by_id(provider)
            .ok_or_else(|| ServerError::AdapterUnavailable(provider.to_string()))?;

        match preset.shape.as_str() {
            "stream-json" => {
                let config = StreamJsonConfig {
                    command: preset.command.clone(),
                    cwd: cwd.to_string(),
                    display_name: preset.name.clone(),
                    permission_mode: opts.mode_id.clone(),
                    extra_args: opts.extra_args.clone(),
                    extra_env: opts.extra_env.clone(),
                };
                let process = StreamJsonProcess::spawn(config, ntx, session_id)
                    .await
                    .map_err(ServerError::SpawnFailed)?;
                // The provider-side id arrives with the init event; until then
                // our id stands in for it.
                let provider_sid = process
                    .provider_session_id()
                    .await
                    .unwrap_or_else(|| session_id.to_string());
                Ok((AdapterHandle::StreamJson(Arc::new(process)), provider_sid))
            }
            _ => {
                let args: Vec<&str> = preset
                    .args
                    .iter()
                    .map(|s| s.as_str())
                    .chain(opts.extra_args.iter().map(|s| s.as_str()))
                    .collect();
                let process = JsonRpcProcess::spawn(
                    &preset.command,
                    &args,
                    cwd,
                    &opts.extra_env,
                    ntx,
                    &preset.name,
                    session_id,
                )
                .await
                .map_err(ServerError::SpawnFailed)?;
                process.initialize().await.map_err(ServerError::SpawnFailed)?;
                let provider_sid = process
                    .new_session(cwd)
                    .await
                    .map_err(ServerError::SpawnFailed)?;
                Ok((AdapterHandle::JsonRpc(Arc::new(process)), provider_sid))
            }
        }
    }

    /// Forward raw updates into the bridge and persist them.
    fn spawn_ingest_task(&self, session_id: &str, ntx: &NotificationSender) {
        let mut rx = ntx.subscribe();
        let bridge = self.bridge.clone();
        let store = self.session_store.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.get("method").and_then(|m| m.as_str()) != Some("session/update") {
                            continue;
                        }
                        let params = msg.get("params").cloned().unwrap_or_default();
                        bridge.ingest(&sid, &params).await;

                        let kind = params
                            .pointer("/update/sessionUpdate")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        // Partial chunks would bloat the history; keep the rest.
                        if kind != "process_output" && kind != "agent_thought_chunk" {
                            if let Err(e) = store.append_history(&sid, msg).await {
                                tracing::warn!(
                                    "[SessionManager] history append failed for {}: {}",
                                    sid,
                                    e
                                );
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[SessionManager] ingest lagged {} messages on {}", n, sid);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// The current adapter for a session, if one is live.
    pub async fn get_adapter(&self, session_id: &str) -> Option<AdapterHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|m| m.handle.clone())
    }

    /// Cold-start recovery: rebuild an adapter from the persisted session row.
    ///
    /// Only in-process (SDK family) providers can be reconstructed. Returns
    /// `Ok(None)` when no session row exists; `COLD_START_IMPOSSIBLE` when a
    /// row exists but its provider cannot be rebuilt.
    pub async fn get_or_recreate_adapter(
        &self,
        session_id: &str,
    ) -> Result<Option<AdapterHandle>, ServerError> {
        if let Some(handle) = self.get_adapter(session_id).await {
            return Ok(Some(handle));
        }

        let row = match self.session_store.get(session_id).await? {
            Some(row) => row,
            None => return Ok(None),
        };

        let provider = row.provider.clone().unwrap_or_default();
        if !is_sdk_provider(&provider) {
            return Err(ServerError::ColdStartImpossible(session_id.to_string()));
        }
        let mut config = SdkConfig::from_env()
            .ok_or_else(|| ServerError::ColdStartImpossible(session_id.to_string()))?;
        if let Some(model) = &row.model {
            config.model = model.clone();
        }

        let (ntx, _) = broadcast::channel::<serde_json::Value>(256);
        self.spawn_ingest_task(session_id, &ntx);
        let adapter = SdkAdapter::new(config, ntx.clone(), session_id);
        let handle = AdapterHandle::Sdk(Arc::new(adapter));

        self.sessions.write().await.insert(
            session_id.to_string(),
            ManagedSession {
                handle: handle.clone(),
                provider_session_id: session_id.to_string(),
                provider,
                phase: SessionPhase::Ready,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.notification_channels
            .write()
            .await
            .insert(session_id.to_string(), ntx);

        tracing::info!("[SessionManager] Recreated adapter for session {}", session_id);
        Ok(Some(handle))
    }

    /// Send a prompt through a session's adapter. Resolves at end-of-turn.
    pub async fn prompt(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<serde_json::Value, ServerError> {
        let (handle, provider_sid) = {
            let mut sessions = self.sessions.write().await;
            let managed = sessions
                .get_mut(session_id)
                .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))?;
            if !managed.handle.is_alive() {
                return Err(ServerError::AdapterDead(managed.provider.clone()));
            }
            managed.phase = SessionPhase::Active;
            (managed.handle.clone(), managed.provider_session_id.clone())
        };

        let result = handle.prompt(&provider_sid, text).await;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(managed) = sessions.get_mut(session_id) {
                managed.phase = if managed.handle.is_alive() {
                    SessionPhase::Ready
                } else {
                    SessionPhase::Terminated
                };
            }
        }
        let _ = self.session_store.set_first_prompt_sent(session_id).await;

        result
    }

    /// Best-effort mode change; persisted for the next cold start.
    pub async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<(), ServerError> {
        let (handle, provider_sid) = {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(m) => (m.handle.clone(), m.provider_session_id.clone()),
                None => return Err(ServerError::SessionNotFound(session_id.to_string())),
            }
        };
        handle.set_mode(&provider_sid, mode_id).await;
        self.session_store.set_mode(session_id, mode_id).await?;
        Ok(())
    }

    /// Cooperative cancel for a session's in-flight prompt.
    pub async fn cancel(&self, session_id: &str) {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|m| (m.handle.clone(), m.provider_session_id.clone()))
        };
        if let Some((handle, provider_sid)) = entry {
            handle.cancel(&provider_sid).await;
        }
    }

    /// Kill a session's adapter and drop it from the registry.
    pub async fn kill_session(&self, session_id: &str) {
        if let Some(mut managed) = self.sessions.write().await.remove(session_id) {
            managed.phase = SessionPhase::Terminated;
            managed.handle.kill().await;
        }
        self.notification_channels.write().await.remove(session_id);
        self.bridge.release(session_id).await;
    }

    /// Kill every live session.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.kill_session(&id).await;
        }
    }

    /// Snapshot of all live sessions.
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, m)| SessionSnapshot {
                session_id: id.clone(),
                provider_session_id: m.provider_session_id.clone(),
                preset_id: m.provider.clone(),
                alive: m.handle.is_alive(),
                phase: format!("{:?}", m.phase).to_lowercase(),
                created_at: m.created_at.clone(),
            })
            .collect()
    }

    /// Whether a session's adapter is alive.
    pub async fn is_alive(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|m| m.handle.is_alive())
            .unwrap_or(false)
    }

    /// Subscribe to a session's raw notification stream.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Option<broadcast::Receiver<serde_json::Value>> {
        let channels = self.notification_channels.read().await;
        channels.get(session_id).map(|tx| tx.subscribe())
    }

    /// The raw notification sender for a session. The orchestrator uses this
    /// to inject tagged child updates into a parent's stream.
    pub async fn notification_sender(&self, session_id: &str) -> Option<NotificationSender> {
        let channels = self.notification_channels.read().await;
        channels.get(session_id).cloned()
    }

    /// Provider id for a session.
    pub async fn get_provider(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|m| m.provider.clone())
    }
}
