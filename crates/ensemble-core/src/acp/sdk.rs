//! SdkAdapter — runs model calls in-process against a messages API.
//!
//! No subprocess: each prompt is a single HTTP round-trip to an
//! Anthropic-compatible `/v1/messages` endpoint. The adapter keeps the
//! conversation history itself and emits synthetic `session/update`
//! notifications (message chunk, then `completed`) so downstream consumers
//! see the same vocabulary as subprocess adapters.
//!
//! Because its only state is the history plus environment credentials, this
//! is the one adapter family that can be reconstructed after a cold start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::NotificationSender;

/// Configuration for the in-process adapter.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
}

impl SdkConfig {
    /// Build from environment. Returns `None` when no API key is configured,
    /// which makes the provider unconstructible (cold start impossible).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("ANTHROPIC_AUTH_TOKEN")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .ok()?;
        if api_key.is_empty() {
            return None;
        }
        Some(Self {
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            api_key,
            model: std::env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            system_prompt: None,
            max_tokens: 8192,
        })
    }
}

/// In-process adapter instance bound to one session.
pub struct SdkAdapter {
    config: SdkConfig,
    client: reqwest::Client,
    notification_tx: NotificationSender,
    our_session_id: String,
    /// role/content pairs accumulated across prompts.
    history: Mutex<Vec<serde_json::Value>>,
    alive: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl SdkAdapter {
    pub fn new(
        config: SdkConfig,
        notification_tx: NotificationSender,
        our_session_id: &str,
    ) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            notification_tx,
            our_session_id: our_session_id.to_string(),
            history: Mutex::new(Vec::new()),
            alive: Arc::new(AtomicBool::new(true)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// One prompt = one messages-API call. Emits a message chunk and a
    /// terminal `completed` update before resolving.
    pub async fn prompt(&self, text: &str) -> Result<serde_json::Value, String> {
        if !self.is_alive() {
            return Err("SDK adapter has been killed".to_string());
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut history = self.history.lock().await;
        history.push(serde_json::json!({ "role": "user", "content": text }));

        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": history.clone(),
        });
        if let Some(system) = &self.config.system_prompt {
            body["system"] = serde_json::Value::String(system.clone());
        }
        drop(history);

        tracing::info!(
            "[SdkAdapter:{}] Calling messages API: {} (model: {})",
            self.our_session_id,
            url,
            self.config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response body: {}", e))?;

        if !status.is_success() {
            self.emit_update(serde_json::json!({
                "sessionUpdate": "error",
                "message": format!("API returned {}", status),
            }));
            return Err(format!("API returned {}: {}", status, response_text));
        }

        let json: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| format!("Failed to parse response JSON: {}", e))?;

        let content = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        self.history
            .lock()
            .await
            .push(serde_json::json!({ "role": "assistant", "content": content }));

        let stop_reason = json
            .get("stop_reason")
            .and_then(|s| s.as_str())
            .unwrap_or("end_turn")
            .to_string();
        let input_tokens = json
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output_tokens = json
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        // A cancel that landed mid-call suppresses nothing: final updates are
        // still delivered, matching the subprocess adapters.
        if self.cancelled.swap(false, Ordering::SeqCst) {
            tracing::debug!(
                "[SdkAdapter:{}] prompt was cancelled mid-flight; delivering final updates anyway",
                self.our_session_id
            );
        }
        if !content.is_empty() {
            self.emit_update(serde_json::json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": content }
            }));
        }
        self.emit_update(serde_json::json!({
            "sessionUpdate": "completed",
            "stopReason": stop_reason,
            "usage": { "inputTokens": input_tokens, "outputTokens": output_tokens },
        }));

        Ok(serde_json::json!({
            "stopReason": stop_reason,
            "content": content,
            "usage": { "inputTokens": input_tokens, "outputTokens": output_tokens },
        }))
    }

    /// Cooperative cancel; the in-flight HTTP call still completes.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Idempotent.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn emit_update(&self, update: serde_json::Value) {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": self.our_session_id,
                "update": update
            }
        });
        let _ = self.notification_tx.send(notification);
    }
}
