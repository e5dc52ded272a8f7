//! Semantic event bridge.
//!
//! Providers speak different raw update dialects; the bridge normalizes each
//! session's raw `session/update` params into a small stable vocabulary of
//! [`AgentEvent`]s and fans them out to subscribers.
//!
//! Guarantees:
//!   - per session, events are delivered in the order they were normalized
//!     (the per-session state lock makes the bridge single-writer per session)
//!   - a slow or failing subscriber cannot affect others (broadcast channel
//!     semantics; laggards drop their own backlog)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};

// ─── Event Vocabulary ───────────────────────────────────────────────────

/// Normalized agent event. This is the whole vocabulary downstream consumers
/// see, regardless of provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    Started,
    Thought {
        text: String,
    },
    OutputChunk {
        text: String,
    },
    ToolCallStarted {
        tool_call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolCallProgress {
        tool_call_id: String,
        partial: String,
    },
    ToolCallEnded {
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
    Completed {
        stop_reason: String,
    },
    Error {
        message: String,
    },
    ModeChanged {
        mode_id: String,
    },
}

/// An event stamped with its session and per-session sequence number.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedEvent {
    pub session_id: String,
    pub seq: u64,
    pub event: AgentEvent,
}

// ─── Per-Session State ──────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    /// Tool calls that have started but not ended.
    open_tool_calls: HashSet<String>,
    seq: u64,
}

struct SessionChannel {
    tx: broadcast::Sender<SequencedEvent>,
    state: Mutex<SessionState>,
}

// ─── Bridge ─────────────────────────────────────────────────────────────

/// Fans normalized events out to per-session subscribers.
pub struct EventBridge {
    sessions: RwLock<HashMap<String, Arc<SessionChannel>>>,
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn channel(&self, session_id: &str) -> Arc<SessionChannel> {
        {
            let sessions = self.sessions.read().await;
            if let Some(ch) = sessions.get(session_id) {
                return ch.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(256);
                Arc::new(SessionChannel {
                    tx,
                    state: Mutex::new(SessionState::default()),
                })
            })
            .clone()
    }

    /// Subscribe to a session's event stream. Dropping the receiver
    /// unsubscribes.
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SequencedEvent> {
        self.channel(session_id).await.tx.subscribe()
    }

    /// Emit a `Started` event for a freshly created session.
    pub async fn emit_started(&self, session_id: &str) {
        let ch = self.channel(session_id).await;
        let mut state = ch.state.lock().await;
        Self::send(&ch, &mut state, session_id, AgentEvent::Started);
    }

    /// Consume one raw `session/update` params object, normalize it, and fan
    /// out the resulting events. The per-session state lock is held for the
    /// whole call, so concurrent ingests for one session serialize.
    pub async fn ingest(&self, session_id: &str, params: &serde_json::Value) {
        let update = match params.get("update") {
            Some(u) => u,
            None => return,
        };
        let ch = self.channel(session_id).await;
        let mut state = ch.state.lock().await;
        for event in normalize_update(update, &mut state) {
            Self::send(&ch, &mut state, session_id, event);
        }
    }

    fn send(
        ch: &SessionChannel,
        state: &mut SessionState,
        session_id: &str,
        event: AgentEvent,
    ) {
        state.seq += 1;
        let _ = ch.tx.send(SequencedEvent {
            session_id: session_id.to_string(),
            seq: state.seq,
            event,
        });
    }

    /// Release a session's channel and state.
    pub async fn release(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

// ─── Normalizer ─────────────────────────────────────────────────────────

/// Map one raw update to zero or more normalized events.
///
/// Both turn-end shapes are accepted: an explicit `completed` update and the
/// legacy `ended` marker. The stop-reason taxonomy is provider-specific and
/// passed through verbatim.
fn normalize_update(update: &serde_json::Value, state: &mut SessionState) -> Vec<AgentEvent> {
    let kind = update
        .get("sessionUpdate")
        .and_then(|s| s.as_str())
        .unwrap_or("");

    let text_content = || {
        update
            .pointer("/content/text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string()
    };

    match kind {
        "agent_thought_chunk" => vec![AgentEvent::Thought {
            text: text_content(),
        }],
        "agent_message_chunk" | "agent_message" => vec![AgentEvent::OutputChunk {
            text: text_content(),
        }],
        "tool_call" => {
            let tool_call_id = update
                .get("toolCallId")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            state.open_tool_calls.insert(tool_call_id.clone());
            vec![AgentEvent::ToolCallStarted {
                tool_call_id,
                name: update
                    .get("title")
                    .or_else(|| update.get("kind"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                args: update.get("rawInput").cloned().unwrap_or_default(),
            }]
        }
        "tool_call_update" => {
            let tool_call_id = update
                .get("toolCallId")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let status = update.get("status").and_then(|v| v.as_str()).unwrap_or("");
            match status {
                "completed" | "failed" => {
                    state.open_tool_calls.remove(&tool_call_id);
                    vec![AgentEvent::ToolCallEnded {
                        tool_call_id,
                        result: update
                            .get("rawOutput")
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default(),
                        is_error: status == "failed",
                    }]
                }
                _ => {
                    // An update for a call we never saw start opens it first.
                    let mut events = Vec::new();
                    if !state.open_tool_calls.contains(&tool_call_id) {
                        state.open_tool_calls.insert(tool_call_id.clone());
                        events.push(AgentEvent::ToolCallStarted {
                            tool_call_id: tool_call_id.clone(),
                            name: update
                                .get("title")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown")
                                .to_string(),
                            args: update.get("rawInput").cloned().unwrap_or_default(),
                        });
                    }
                    events.push(AgentEvent::ToolCallProgress {
                        tool_call_id,
                        partial: update
                            .get("rawOutput")
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default(),
                    });
                    events
                }
            }
        }
        "completed" | "ended" => {
            state.open_tool_calls.clear();
            vec![AgentEvent::Completed {
                stop_reason: update
                    .get("stopReason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("end_turn")
                    .to_string(),
            }]
        }
        "error" => vec![AgentEvent::Error {
            message: update
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        }],
        "mode_changed" | "current_mode_update" => vec![AgentEvent::ModeChanged {
            mode_id: update
                .get("modeId")
                .or_else(|| update.get("currentModeId"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        }],
        // process_output, plan updates, etc. carry no semantic meaning here
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(update: serde_json::Value) -> Vec<AgentEvent> {
        let mut state = SessionState::default();
        normalize_update(&update, &mut state)
    }

    #[test]
    fn thought_and_message_chunks() {
        let events = normalize(serde_json::json!({
            "sessionUpdate": "agent_thought_chunk",
            "content": { "type": "text", "text": "hmm" }
        }));
        assert_eq!(events, vec![AgentEvent::Thought { text: "hmm".into() }]);

        let events = normalize(serde_json::json!({
            "sessionUpdate": "agent_message_chunk",
            "content": { "type": "text", "text": "hello" }
        }));
        assert_eq!(
            events,
            vec![AgentEvent::OutputChunk {
                text: "hello".into()
            }]
        );
    }

    #[test]
    fn tool_call_lifecycle() {
        let mut state = SessionState::default();
        let started = normalize_update(
            &serde_json::json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "title": "Read: src/lib.rs",
                "rawInput": { "path": "src/lib.rs" }
            }),
            &mut state,
        );
        assert!(matches!(started[0], AgentEvent::ToolCallStarted { .. }));
        assert!(state.open_tool_calls.contains("t1"));

        let ended = normalize_update(
            &serde_json::json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed",
                "rawOutput": "file contents"
            }),
            &mut state,
        );
        assert_eq!(
            ended,
            vec![AgentEvent::ToolCallEnded {
                tool_call_id: "t1".into(),
                result: "file contents".into(),
                is_error: false,
            }]
        );
        assert!(state.open_tool_calls.is_empty());
    }

    #[test]
    fn both_turn_end_shapes_normalize_to_completed() {
        let explicit = normalize(serde_json::json!({
            "sessionUpdate": "completed",
            "stopReason": "end_turn"
        }));
        let legacy = normalize(serde_json::json!({ "sessionUpdate": "ended" }));
        assert!(matches!(explicit[0], AgentEvent::Completed { .. }));
        assert!(matches!(legacy[0], AgentEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn events_are_sequenced_per_session() {
        let bridge = EventBridge::new();
        let mut rx = bridge.subscribe("s1").await;

        bridge
            .ingest(
                "s1",
                &serde_json::json!({
                    "sessionId": "s1",
                    "update": { "sessionUpdate": "agent_message_chunk", "content": { "type": "text", "text": "a" } }
                }),
            )
            .await;
        bridge
            .ingest(
                "s1",
                &serde_json::json!({
                    "sessionId": "s1",
                    "update": { "sessionUpdate": "completed", "stopReason": "end_turn" }
                }),
            )
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert!(matches!(second.event, AgentEvent::Completed { .. }));
    }
}
