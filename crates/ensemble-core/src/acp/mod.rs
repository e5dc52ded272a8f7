//! Agent adapter layer.
//!
//! Every agent provider is reached through one of three adapter shapes:
//!
//!   - [`JsonRpcProcess`] — spawned binary speaking JSON-RPC over stdio
//!     (`initialize`, `session/new`, `session/prompt`, `session/cancel`,
//!     asynchronous `session/update` notifications)
//!   - [`StreamJsonProcess`] — spawned binary speaking line-delimited JSON;
//!     the session id emerges from the first "system init" event
//!   - [`SdkAdapter`] — in-process HTTP calls against a messages API
//!
//! [`AdapterHandle`] unifies them behind one surface; the
//! [`SessionManager`](manager::SessionManager) owns the live handles.

pub mod json_rpc;
pub mod manager;
pub mod sdk;
pub mod stream_json;

pub use json_rpc::JsonRpcProcess;
pub use manager::{CreateSessionOptions, SessionManager, SessionSnapshot};
pub use sdk::SdkAdapter;
pub use stream_json::StreamJsonProcess;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ServerError;

/// Broadcast sender carrying raw JSON-RPC style notifications for a session.
pub type NotificationSender = broadcast::Sender<serde_json::Value>;

// ─── Adapter Handle ─────────────────────────────────────────────────────

/// A live adapter of any shape. Cheap to clone; the processes inside are
/// reference-counted.
#[derive(Clone)]
pub enum AdapterHandle {
    JsonRpc(Arc<JsonRpcProcess>),
    StreamJson(Arc<StreamJsonProcess>),
    Sdk(Arc<SdkAdapter>),
}

impl AdapterHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JsonRpc(_) => "json-rpc",
            Self::StreamJson(_) => "stream-json",
            Self::Sdk(_) => "sdk",
        }
    }

    /// Truthful liveness.
    pub fn is_alive(&self) -> bool {
        match self {
            Self::JsonRpc(p) => p.is_alive(),
            Self::StreamJson(p) => p.is_alive(),
            Self::Sdk(a) => a.is_alive(),
        }
    }

    /// Send a prompt and wait for the provider's end-of-turn. The returned
    /// value is the provider's prompt result (stop reason and friends).
    pub async fn prompt(
        &self,
        provider_session_id: &str,
        text: &str,
    ) -> Result<serde_json::Value, ServerError> {
        if !self.is_alive() {
            return Err(ServerError::AdapterDead(self.kind().to_string()));
        }
        let result = match self {
            Self::JsonRpc(p) => p.prompt(provider_session_id, text).await,
            Self::StreamJson(p) => p
                .prompt(text)
                .await
                .map(|stop| serde_json::json!({ "stopReason": stop })),
            Self::Sdk(a) => a.prompt(text).await,
        };
        result.map_err(ServerError::Internal)
    }

    /// Best-effort mode change. Providers without mode support must not fail
    /// the session.
    pub async fn set_mode(&self, provider_session_id: &str, mode_id: &str) {
        match self {
            Self::JsonRpc(p) => p.set_mode(provider_session_id, mode_id).await,
            Self::StreamJson(p) => p.set_permission_mode(mode_id).await,
            Self::Sdk(_) => {}
        }
    }

    /// Cooperative cancel: in-flight prompts may still deliver final updates,
    /// and later prompts on the same session are accepted.
    pub async fn cancel(&self, provider_session_id: &str) {
        match self {
            Self::JsonRpc(p) => p.cancel(provider_session_id).await,
            Self::StreamJson(p) => p.cancel().await,
            Self::Sdk(a) => a.cancel().await,
        }
    }

    /// Release all resources. Idempotent.
    pub async fn kill(&self) {
        match self {
            Self::JsonRpc(p) => p.kill().await,
            Self::StreamJson(p) => p.kill().await,
            Self::Sdk(a) => a.kill().await,
        }
    }
}

// ─── Provider Presets ───────────────────────────────────────────────────

/// Provider presets for known coding agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPreset {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub description: String,
    /// Wire shape: "json-rpc", "stream-json", or "sdk".
    pub shape: String,
}

/// Known provider presets. Subprocess providers require the binary on PATH;
/// the sdk provider only needs API credentials.
pub fn get_presets() -> Vec<ProviderPreset> {
    vec![
        ProviderPreset {
            name: "opencode".to_string(),
            command: "opencode".to_string(),
            args: vec!["acp".to_string()],
            description: "OpenCode AI coding agent".to_string(),
            shape: "json-rpc".to_string(),
        },
        ProviderPreset {
            name: "gemini".to_string(),
            command: "gemini".to_string(),
            args: vec!["--experimental-acp".to_string()],
            description: "Google Gemini CLI".to_string(),
            shape: "json-rpc".to_string(),
        },
        ProviderPreset {
            name: "copilot".to_string(),
            command: "copilot".to_string(),
            args: vec!["--acp".to_string()],
            description: "GitHub Copilot CLI".to_string(),
            shape: "json-rpc".to_string(),
        },
        ProviderPreset {
            name: "claude".to_string(),
            command: "claude".to_string(),
            args: vec![],
            description: "Claude Code (stream-json)".to_string(),
            shape: "stream-json".to_string(),
        },
        ProviderPreset {
            name: "anthropic-api".to_string(),
            command: String::new(),
            args: vec![],
            description: "Direct messages API (in-process)".to_string(),
            shape: "sdk".to_string(),
        },
    ]
}

pub fn get_preset_by_id(id: &str) -> Option<ProviderPreset> {
    get_presets().into_iter().find(|p| p.name == id)
}

/// Whether a provider runs in-process and can therefore be reconstructed
/// after a cold start.
pub fn is_sdk_provider(provider: &str) -> bool {
    matches!(provider, "anthropic-api" | "workspace-agent" | "sdk")
}

/// Locate a binary on PATH. GUI-launched processes can carry a minimal PATH,
/// so callers fall back to the bare command name when this returns `None`.
pub fn which(command: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
    }
    None
}
