//! JsonRpcProcess — manages a single agent child process with JSON-RPC over stdio.
//!
//! Lifecycle:
//!   1. `spawn(command, args)` — start the child, launch a background stdout reader
//!   2. `initialize()`         — send "initialize" request, wait for response
//!   3. `new_session(cwd)`     — send "session/new", get back sessionId
//!   4. `prompt(sid, text)`    — send "session/prompt" (5-min timeout)
//!   5. `kill()`               — terminate the process
//!
//! Agent→client requests (permissions, fs, terminal) are handled in the
//! background reader. Notifications are rewritten to carry our session id and
//! forwarded to the broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use super::NotificationSender;

/// A managed JSON-RPC agent child process.
pub struct JsonRpcProcess {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<Mutex<Option<Child>>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>>,
    next_id: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    initialized: AtomicBool,
    display_name: String,
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl JsonRpcProcess {
    /// Spawn the agent process and start the background reader.
    ///
    /// `our_session_id` is used to rewrite the agent's session ID in
    /// notifications so subscribers match on the correct session.
    pub async fn spawn(
        command: &str,
        args: &[&str],
        cwd: &str,
        extra_env: &HashMap<String, String>,
        notification_tx: NotificationSender,
        display_name: &str,
        our_session_id: &str,
    ) -> Result<Self, String> {
        tracing::info!(
            "[JsonRpcProcess:{}] Spawning: {} {} (cwd: {})",
            display_name,
            command,
            args.join(" "),
            cwd,
        );

        let resolved_command = super::which(command).unwrap_or_else(|| command.to_string());

        let mut cmd = tokio::process::Command::new(&resolved_command);
        cmd.args(args)
            .current_dir(cwd)
            .env("NODE_NO_READLINE", "1")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in extra_env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            format!(
                "Failed to spawn '{}' (resolved: '{}'): {}. Is it installed and in PATH?",
                command, resolved_command, e
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "No stdin on child process".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "No stdout on child process".to_string())?;
        let stderr = child.stderr.take();

        let alive = Arc::new(AtomicBool::new(true));
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stdin = Arc::new(Mutex::new(stdin));

        let name = display_name.to_string();

        // Log stderr in background and forward as process_output updates
        if let Some(stderr) = stderr {
            let name_clone = name.clone();
            let ntx_stderr = notification_tx.clone();
            let our_sid_stderr = our_session_id.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!("[JsonRpcProcess:{} stderr] {}", name_clone, line);
                        let notification = serde_json::json!({
                            "jsonrpc": "2.0",
                            "method": "session/update",
                            "params": {
                                "sessionId": our_sid_stderr,
                                "update": {
                                    "sessionUpdate": "process_output",
                                    "source": "stderr",
                                    "data": format!("{}\n", line),
                                    "displayName": name_clone,
                                }
                            }
                        });
                        let _ = ntx_stderr.send(notification);
                    }
                }
            });
        }

        // Background stdout reader — dispatches responses, notifications, agent requests
        let alive_clone = alive.clone();
        let pending_clone = pending.clone();
        let ntx = notification_tx.clone();
        let stdin_clone = stdin.clone();
        let name_clone = name.clone();
        let our_sid = our_session_id.to_string();

        let reader_handle = tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                let msg: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::debug!(
                            "[JsonRpcProcess:{}] Non-JSON stdout: {}",
                            name_clone,
                            &line[..line.len().min(200)]
                        );
                        continue;
                    }
                };

                let has_id = msg.get("id").map(|id| !id.is_null()).unwrap_or(false);
                let has_result = msg.get("result").is_some();
                let has_error = msg.get("error").is_some();
                let has_method = msg.get("method").and_then(|m| m.as_str()).is_some();

                if has_id && (has_result || has_error) {
                    // Response to a pending request
                    let id = msg["id"].as_u64().unwrap_or(0);
                    let mut map = pending_clone.lock().await;
                    if let Some(tx) = map.remove(&id) {
                        if has_error {
                            let err_msg =
                                msg["error"]["message"].as_str().unwrap_or("unknown error");
                            let err_code = msg["error"]["code"].as_i64().unwrap_or(0);
                            let _ = tx.send(Err(format!("Agent error [{}]: {}", err_code, err_msg)));
                        } else {
                            let _ = tx.send(Ok(msg["result"].clone()));
                        }
                    }
                } else if has_id && has_method {
                    // Agent→client request — handle it
                    let method = msg["method"].as_str().unwrap_or("");
                    let id_val = msg["id"].clone();
                    tracing::info!(
                        "[JsonRpcProcess:{}] Agent request: {} (id={})",
                        name_clone,
                        method,
                        id_val
                    );
                    let response = handle_agent_request(method, &msg["params"]).await;
                    let reply = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": response,
                    });
                    if let Ok(data) = serde_json::to_string(&reply) {
                        let mut stdin = stdin_clone.lock().await;
                        let _ = stdin.write_all(format!("{}\n", data).as_bytes()).await;
                        let _ = stdin.flush().await;
                    }
                } else if has_method {
                    // Notification (no id) — rewrite session id and forward
                    let mut rewritten = msg.clone();
                    if let Some(params) = rewritten.get_mut("params") {
                        if params.get("sessionId").is_some() {
                            params["sessionId"] = serde_json::Value::String(our_sid.clone());
                        }
                    }
                    let _ = ntx.send(rewritten);
                } else {
                    tracing::debug!(
                        "[JsonRpcProcess:{}] Unhandled message: {}",
                        name_clone,
                        &line[..line.len().min(200)]
                    );
                }
            }

            alive_clone.store(false, Ordering::SeqCst);
            tracing::info!("[JsonRpcProcess:{}] stdout reader finished", name_clone);
        });

        // Wait briefly for the process to stabilize
        tokio::time::sleep(Duration::from_millis(300)).await;

        if !alive.load(Ordering::SeqCst) {
            return Err(format!("{} process died during startup", display_name));
        }

        Ok(Self {
            stdin,
            child: Arc::new(Mutex::new(Some(child))),
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            alive,
            initialized: AtomicBool::new(false),
            display_name: display_name.to_string(),
            _reader_handle: reader_handle,
        })
    }

    /// Whether the process is still alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait for the response.
    pub async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value, String> {
        if !self.is_alive() {
            return Err(format!("{} process is not alive", self.display_name));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(id, tx);

        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let data = format!(
            "{}\n",
            serde_json::to_string(&msg).map_err(|e| format!("Serialize {}: {}", method, e))?
        );

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| format!("Write {}: {}", method, e))?;
            stdin
                .flush()
                .await
                .map_err(|e| format!("Flush {}: {}", method, e))?;
        }

        let default_timeout = match method {
            "initialize" | "session/new" => 15_000,
            "session/prompt" => 300_000, // 5 min
            _ => 30_000,
        };
        let timeout_dur = Duration::from_millis(timeout_ms.unwrap_or(default_timeout));

        match tokio::time::timeout(timeout_dur, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(format!("Channel closed for {} (id={})", method, id)),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(format!(
                    "Timeout waiting for {} (id={}, {}ms)",
                    method,
                    id,
                    timeout_dur.as_millis()
                ))
            }
        }
    }

    /// Initialize the protocol. Idempotent: a second call is a no-op.
    pub async fn initialize(&self) -> Result<(), String> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .send_request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": 1,
                    "clientInfo": {
                        "name": "ensemble",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
                None,
            )
            .await?;
        tracing::info!(
            "[JsonRpcProcess:{}] Initialized: {}",
            self.display_name,
            serde_json::to_string(&result).unwrap_or_default()
        );
        Ok(())
    }

    /// Create a new provider-side session. Returns the agent's session ID.
    pub async fn new_session(&self, cwd: &str) -> Result<String, String> {
        let result = self
            .send_request(
                "session/new",
                serde_json::json!({
                    "cwd": cwd,
                    "mcpServers": []
                }),
                None,
            )
            .await?;

        let session_id = result["sessionId"]
            .as_str()
            .ok_or_else(|| "No sessionId in session/new response".to_string())?
            .to_string();

        tracing::info!(
            "[JsonRpcProcess:{}] Session created: {}",
            self.display_name,
            session_id
        );
        Ok(session_id)
    }

    /// Send a prompt to an existing session. 5-minute timeout.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<serde_json::Value, String> {
        self.send_request(
            "session/prompt",
            serde_json::json!({
                "sessionId": session_id,
                "prompt": [{ "type": "text", "text": text }]
            }),
            Some(300_000),
        )
        .await
    }

    /// Best-effort session/set_mode; errors are swallowed.
    pub async fn set_mode(&self, session_id: &str, mode_id: &str) {
        let result = self
            .send_request(
                "session/set_mode",
                serde_json::json!({ "sessionId": session_id, "modeId": mode_id }),
                Some(10_000),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!(
                "[JsonRpcProcess:{}] set_mode ignored: {}",
                self.display_name,
                e
            );
        }
    }

    /// Send session/cancel notification (no response expected).
    pub async fn cancel(&self, session_id: &str) {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/cancel",
            "params": { "sessionId": session_id }
        });
        if let Ok(data) = serde_json::to_string(&msg) {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.write_all(format!("{}\n", data).as_bytes()).await;
            let _ = stdin.flush().await;
        }
    }

    /// Kill the agent process. Idempotent.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            tracing::info!("[JsonRpcProcess:{}] Killing process", self.display_name);
            let _ = child.kill().await;
        }
        // Reject all pending requests
        let mut map = self.pending.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err("Process killed".to_string()));
        }
    }
}

/// Handle agent→client requests. Auto-approves permissions, handles fs ops.
async fn handle_agent_request(method: &str, params: &serde_json::Value) -> serde_json::Value {
    match method {
        "session/request_permission" => {
            serde_json::json!({
                "outcome": { "outcome": "approved" }
            })
        }
        "fs/read_text_file" => {
            let path = params["path"].as_str().unwrap_or("");
            match tokio::fs::read_to_string(path).await {
                Ok(content) => serde_json::json!({ "content": content }),
                Err(e) => serde_json::json!({
                    "error": format!("Failed to read file: {}", e)
                }),
            }
        }
        "fs/write_text_file" => {
            let path = params["path"].as_str().unwrap_or("");
            let content = params["content"].as_str().unwrap_or("");
            if let Some(parent) = std::path::Path::new(path).parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::write(path, content).await {
                Ok(_) => serde_json::json!({}),
                Err(e) => serde_json::json!({
                    "error": format!("Failed to write file: {}", e)
                }),
            }
        }
        "terminal/create" => {
            serde_json::json!({ "terminalId": uuid::Uuid::new_v4().to_string() })
        }
        "terminal/output" => {
            serde_json::json!({ "output": "" })
        }
        "terminal/wait_for_exit" => {
            serde_json::json!({ "exitCode": 0 })
        }
        "terminal/kill" | "terminal/release" => {
            serde_json::json!({})
        }
        _ => {
            tracing::warn!("[JsonRpcProcess] Unknown agent request: {}", method);
            serde_json::json!({})
        }
    }
}
