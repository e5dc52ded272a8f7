//! StreamJsonProcess — manages an agent speaking line-delimited JSON.
//!
//! This wire format differs from JSON-RPC:
//!   - stdin/stdout carry NDJSON with provider message types
//!     (system, assistant, user, result, stream_event)
//!   - there is no request/response pairing; a prompt completes when the
//!     provider emits a `result` message
//!   - the provider-side session id arrives in the first `system`/`init`
//!     event rather than from a `session/new` response
//!
//! Output is translated into `session/update` notifications so the rest of
//! the system (bridge, SSE, orchestrator) sees one vocabulary.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, Mutex};

// ─── Wire Types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    content_block: Option<StreamContentBlock>,
    delta: Option<StreamDelta>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    content_type: String,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
    tool_use_id: Option<String>,
    content: Option<serde_json::Value>,
    is_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
    #[allow(dead_code)]
    role: Option<String>,
    content: Vec<WireContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireOutput {
    #[serde(rename = "type")]
    msg_type: String,
    subtype: Option<String>,
    session_id: Option<String>,
    message: Option<WireMessage>,
    event: Option<StreamEvent>,
    result: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

// ─── Config ─────────────────────────────────────────────────────────────

/// Configuration for spawning a stream-json agent process.
#[derive(Debug, Clone)]
pub struct StreamJsonConfig {
    /// Command to run
    pub command: String,
    /// Working directory
    pub cwd: String,
    /// Display name for logging
    pub display_name: String,
    /// Permission mode: "acceptEdits" | "bypassPermissions" | "plan"
    pub permission_mode: Option<String>,
    /// Extra CLI args
    pub extra_args: Vec<String>,
    /// Extra environment variables
    pub extra_env: HashMap<String, String>,
}

impl Default for StreamJsonConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            cwd: ".".to_string(),
            display_name: "stream-json agent".to_string(),
            permission_mode: Some("bypassPermissions".to_string()),
            extra_args: Vec::new(),
            extra_env: HashMap::new(),
        }
    }
}

// ─── Process State ──────────────────────────────────────────────────────

#[derive(Default)]
struct StreamState {
    tool_use_names: HashMap<String, String>,
    rendered_tool_ids: HashSet<String>,
    has_rendered_stream_content: bool,
}

/// Stream-json agent process manager.
pub struct StreamJsonProcess {
    config: StreamJsonConfig,
    session_id: Arc<Mutex<Option<String>>>,
    alive: Arc<AtomicBool>,
    notification_tx: broadcast::Sender<serde_json::Value>,
    state: Arc<Mutex<StreamState>>,
    stdin_tx: Arc<Mutex<Option<tokio::process::ChildStdin>>>,
    prompt_complete_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    permission_mode: Arc<Mutex<String>>,
    /// Our session id, used in emitted notifications.
    our_session_id: String,
}

impl StreamJsonProcess {
    pub fn new(
        config: StreamJsonConfig,
        notification_tx: broadcast::Sender<serde_json::Value>,
        our_session_id: &str,
    ) -> Self {
        let permission_mode = config
            .permission_mode
            .clone()
            .unwrap_or_else(|| "bypassPermissions".to_string());
        Self {
            config,
            session_id: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
            notification_tx,
            state: Arc::new(Mutex::new(StreamState::default())),
            stdin_tx: Arc::new(Mutex::new(None)),
            prompt_complete_tx: Arc::new(Mutex::new(None)),
            permission_mode: Arc::new(Mutex::new(permission_mode)),
            our_session_id: our_session_id.to_string(),
        }
    }

    /// Provider-side session id, once the init event has arrived.
    pub async fn provider_session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Spawn and start in one call.
    pub async fn spawn(
        config: StreamJsonConfig,
        notification_tx: broadcast::Sender<serde_json::Value>,
        our_session_id: &str,
    ) -> Result<Self, String> {
        let process = Self::new(config, notification_tx, our_session_id);
        process.start().await?;
        Ok(process)
    }

    /// Start the process in stream-json mode. Idempotent: a second call on a
    /// live process is a no-op.
    pub async fn start(&self) -> Result<(), String> {
        if self.is_alive() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.arg("-p");
        cmd.args(["--output-format", "stream-json"]);
        cmd.args(["--input-format", "stream-json"]);
        cmd.arg("--include-partial-messages");
        cmd.arg("--verbose");

        let permission_mode = self.permission_mode.lock().await.clone();
        if permission_mode == "bypassPermissions" {
            cmd.arg("--dangerously-skip-permissions");
        } else {
            cmd.args(["--permission-mode", &permission_mode]);
        }

        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }
        for (k, v) in &self.config.extra_env {
            cmd.env(k, v);
        }

        cmd.current_dir(&self.config.cwd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::info!(
            "[StreamJson:{}] Spawning: {} -p --output-format stream-json ... (cwd: {})",
            self.config.display_name,
            self.config.command,
            self.config.cwd
        );

        let mut child = cmd.spawn().map_err(|e| {
            format!(
                "Failed to spawn '{}' - is it installed? Error: {}",
                self.config.command, e
            )
        })?;

        let stdin = child.stdin.take().ok_or("Failed to get stdin")?;
        let stdout = child.stdout.take().ok_or("Failed to get stdout")?;
        let stderr = child.stderr.take().ok_or("Failed to get stderr")?;

        *self.stdin_tx.lock().await = Some(stdin);
        self.alive.store(true, Ordering::SeqCst);

        // Stdout reader: translate wire messages into session/update notifications
        let session_id = self.session_id.clone();
        let alive = self.alive.clone();
        let notification_tx = self.notification_tx.clone();
        let state = self.state.clone();
        let prompt_complete_tx = self.prompt_complete_tx.clone();
        let display_name = self.config.display_name.clone();
        let our_sid = self.our_session_id.clone();

        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let line = clear_ansi(line.trim());
                if line.is_empty() || !line.starts_with('{') {
                    continue;
                }

                match serde_json::from_str::<WireOutput>(&line) {
                    Ok(msg) => {
                        handle_wire_message(
                            msg,
                            &our_sid,
                            &session_id,
                            &notification_tx,
                            &state,
                            &prompt_complete_tx,
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::debug!(
                            "[StreamJson:{}] Failed to parse: {} - {}",
                            display_name,
                            e,
                            &line[..line.len().min(100)]
                        );
                    }
                }
            }

            alive.store(false, Ordering::SeqCst);
            tracing::info!("[StreamJson] stdout reader exited");
        });

        // Stderr reader
        let display_name2 = self.config.display_name.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::warn!("[StreamJson:{} stderr] {}", display_name2, line);
                }
            }
        });

        // Wait for process to stabilize
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        if !self.is_alive() {
            return Err("Stream-json process died during startup".to_string());
        }

        tracing::info!("[StreamJson:{}] Process started", self.config.display_name);
        Ok(())
    }

    /// Send a prompt. Resolves with the stop reason after the provider's
    /// `result` message.
    pub async fn prompt(&self, text: &str) -> Result<String, String> {
        if !self.is_alive() {
            return Err("Stream-json process is not alive".to_string());
        }

        {
            let mut state = self.state.lock().await;
            state.has_rendered_stream_content = false;
        }

        let session_id = self.session_id.lock().await.clone();
        let user_input = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": text }]
            },
            "session_id": session_id
        });

        let (tx, rx) = oneshot::channel();
        *self.prompt_complete_tx.lock().await = Some(tx);

        let mut stdin_guard = self.stdin_tx.lock().await;
        if let Some(ref mut stdin) = *stdin_guard {
            let msg = format!("{}\n", user_input);
            stdin
                .write_all(msg.as_bytes())
                .await
                .map_err(|e| format!("Failed to write to stdin: {}", e))?;
            stdin
                .flush()
                .await
                .map_err(|e| format!("Failed to flush stdin: {}", e))?;
        } else {
            return Err("stdin not available".to_string());
        }
        drop(stdin_guard);

        match rx.await {
            Ok(stop_reason) => Ok(stop_reason),
            Err(_) => Err("Prompt was cancelled or process exited".to_string()),
        }
    }

    /// Record a mode for the next spawn; the running process keeps its flags.
    pub async fn set_permission_mode(&self, mode: &str) {
        let mapped = match mode {
            "plan" => "plan",
            "acceptEdits" => "acceptEdits",
            _ => "bypassPermissions",
        };
        *self.permission_mode.lock().await = mapped.to_string();
    }

    /// Cancel the current prompt. There is no cancel message on this wire;
    /// dropping the completion channel unblocks the caller and later prompts
    /// are accepted.
    pub async fn cancel(&self) {
        let _ = self.prompt_complete_tx.lock().await.take();
    }

    /// Kill the process. Idempotent.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Drop stdin to signal EOF
        let _ = self.stdin_tx.lock().await.take();
    }
}

// ─── Message Handling ───────────────────────────────────────────────────

async fn handle_wire_message(
    msg: WireOutput,
    our_sid: &str,
    session_id: &Arc<Mutex<Option<String>>>,
    notification_tx: &broadcast::Sender<serde_json::Value>,
    state: &Arc<Mutex<StreamState>>,
    prompt_complete_tx: &Arc<Mutex<Option<oneshot::Sender<String>>>>,
) {
    match msg.msg_type.as_str() {
        "system" => {
            if msg.subtype.as_deref() == Some("init") {
                if let Some(new_session_id) = msg.session_id {
                    *session_id.lock().await = Some(new_session_id);
                }
            }
        }

        "stream_event" => {
            if let Some(event) = msg.event {
                process_stream_event(event, our_sid, notification_tx, state).await;
            }
        }

        "assistant" => {
            if let Some(message) = msg.message {
                let mut state_guard = state.lock().await;
                for c in message.content {
                    if c.content_type == "tool_use" {
                        let tool_id = c.id.clone().unwrap_or_default();
                        let tool_name = c.name.clone().unwrap_or_else(|| "unknown".to_string());
                        state_guard
                            .tool_use_names
                            .insert(tool_id.clone(), tool_name.clone());

                        if !state_guard.rendered_tool_ids.contains(&tool_id) {
                            let input = c.input.clone().unwrap_or(serde_json::json!({}));
                            emit_session_update(
                                notification_tx,
                                our_sid,
                                serde_json::json!({
                                    "sessionUpdate": "tool_call",
                                    "toolCallId": tool_id,
                                    "title": tool_name,
                                    "status": "running",
                                    "rawInput": input
                                }),
                            );
                            state_guard.rendered_tool_ids.insert(tool_id);
                        }
                    }
                }
            }
        }

        "user" => {
            if let Some(message) = msg.message {
                let state_guard = state.lock().await;
                for c in message.content {
                    if c.content_type == "tool_result" {
                        let tool_id = c.tool_use_id.clone().unwrap_or_default();
                        let tool_name = state_guard
                            .tool_use_names
                            .get(&tool_id)
                            .cloned()
                            .unwrap_or_else(|| "unknown".to_string());
                        let is_error = c.is_error.unwrap_or(false);
                        let output = extract_tool_result_text(&c);
                        let status = if is_error { "failed" } else { "completed" };

                        emit_session_update(
                            notification_tx,
                            our_sid,
                            serde_json::json!({
                                "sessionUpdate": "tool_call_update",
                                "toolCallId": tool_id,
                                "title": tool_name,
                                "status": status,
                                "rawOutput": output
                            }),
                        );
                    }
                }
            }
        }

        "result" => {
            let result_text = msg.result.clone().unwrap_or_default();
            let has_rendered = state.lock().await.has_rendered_stream_content;

            if !result_text.is_empty() && !has_rendered {
                emit_session_update(
                    notification_tx,
                    our_sid,
                    serde_json::json!({
                        "sessionUpdate": "agent_message_chunk",
                        "content": { "type": "text", "text": result_text }
                    }),
                );
            }

            let stop_reason = msg.subtype.unwrap_or_else(|| "end_turn".to_string());

            // Terminal update goes out before the prompt future resolves.
            let mut completed = serde_json::json!({
                "sessionUpdate": "completed",
                "stopReason": stop_reason,
            });
            if let Some(usage) = msg.usage {
                completed["usage"] = serde_json::json!({
                    "inputTokens": usage.input_tokens,
                    "outputTokens": usage.output_tokens,
                });
            }
            emit_session_update(notification_tx, our_sid, completed);

            if let Some(tx) = prompt_complete_tx.lock().await.take() {
                let _ = tx.send(stop_reason);
            }
        }

        _ => {}
    }
}

async fn process_stream_event(
    event: StreamEvent,
    sid: &str,
    notification_tx: &broadcast::Sender<serde_json::Value>,
    state: &Arc<Mutex<StreamState>>,
) {
    match event.event_type.as_str() {
        "content_block_start" => {
            if let Some(block) = event.content_block {
                if block.block_type == "tool_use" {
                    if let (Some(id), Some(name)) = (block.id, block.name) {
                        state.lock().await.tool_use_names.insert(id, name);
                    }
                }
            }
        }

        "content_block_delta" => {
            if let Some(delta) = event.delta {
                let mut state_guard = state.lock().await;
                match delta.delta_type.as_str() {
                    "thinking_delta" => {
                        if let Some(thinking) = delta.thinking {
                            state_guard.has_rendered_stream_content = true;
                            emit_session_update(
                                notification_tx,
                                sid,
                                serde_json::json!({
                                    "sessionUpdate": "agent_thought_chunk",
                                    "content": { "type": "text", "text": thinking }
                                }),
                            );
                        }
                    }
                    "text_delta" => {
                        if let Some(text) = delta.text {
                            state_guard.has_rendered_stream_content = true;
                            emit_session_update(
                                notification_tx,
                                sid,
                                serde_json::json!({
                                    "sessionUpdate": "agent_message_chunk",
                                    "content": { "type": "text", "text": text }
                                }),
                            );
                        }
                    }
                    "input_json_delta" => {
                        state_guard.has_rendered_stream_content = true;
                    }
                    _ => {}
                }
            }
        }

        "message_delta" => {
            if let Some(delta) = event.delta {
                if delta.stop_reason.is_some() {
                    tracing::debug!(
                        "[StreamJson] Message delta with stop_reason: {:?}",
                        delta.stop_reason
                    );
                }
            }
        }

        _ => {}
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn emit_session_update(
    tx: &broadcast::Sender<serde_json::Value>,
    session_id: &str,
    update: serde_json::Value,
) {
    let notification = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": session_id,
            "update": update
        }
    });
    let _ = tx.send(notification);
}

fn clear_ansi(text: &str) -> String {
    let re = Regex::new(r"\x1b\[[0-9;]*m").unwrap();
    re.replace_all(text, "").to_string()
}

fn extract_tool_result_text(content: &WireContent) -> String {
    match &content.content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(v) => serde_json::to_string(v).unwrap_or_default(),
        None => String::new(),
    }
}
