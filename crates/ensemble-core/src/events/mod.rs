//! Workspace-level agent event bus.
//!
//! Carries coordination events (task assigned, report submitted, agent
//! error, ...) between agents. Subscriptions are per-agent with event-type
//! filters; matched events are queued per subscriber and drained when the
//! agent next asks. Process-wide mutable state with explicit init via
//! `EventBus::new()`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEventType {
    AgentCreated,
    TaskAssigned,
    TaskStatusChanged,
    TaskCompleted,
    ReportSubmitted,
    MessageSent,
    AgentError,
}

impl AgentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentCreated => "AGENT_CREATED",
            Self::TaskAssigned => "TASK_ASSIGNED",
            Self::TaskStatusChanged => "TASK_STATUS_CHANGED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::ReportSubmitted => "REPORT_SUBMITTED",
            Self::MessageSent => "MESSAGE_SENT",
            Self::AgentError => "AGENT_ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AGENT_CREATED" => Some(Self::AgentCreated),
            "TASK_ASSIGNED" => Some(Self::TaskAssigned),
            "TASK_STATUS_CHANGED" => Some(Self::TaskStatusChanged),
            "TASK_COMPLETED" => Some(Self::TaskCompleted),
            "REPORT_SUBMITTED" => Some(Self::ReportSubmitted),
            "MESSAGE_SENT" => Some(Self::MessageSent),
            "AGENT_ERROR" => Some(Self::AgentError),
            _ => None,
        }
    }
}

/// One coordination event, attributed to the agent that caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub event_type: AgentEventType,
    pub agent_id: String,
    pub workspace_id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A standing subscription: which events an agent wants queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubscription {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub event_types: Vec<AgentEventType>,
    /// Skip events caused by the subscriber itself.
    pub exclude_self: bool,
    /// Remove the subscription after its first match.
    pub one_shot: bool,
    pub wait_group_id: Option<String>,
    pub priority: i32,
}

struct BusInner {
    subscriptions: Vec<EventSubscription>,
    /// agent_id → queued events awaiting drain.
    pending: HashMap<String, Vec<AgentEvent>>,
}

/// In-memory event bus shared by tools and the orchestrator.
pub struct EventBus {
    inner: RwLock<BusInner>,
    /// Live firehose for in-process listeners (orchestrator, SSE).
    firehose: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (firehose, _) = tokio::sync::broadcast::channel(256);
        Self {
            inner: RwLock::new(BusInner {
                subscriptions: Vec::new(),
                pending: HashMap::new(),
            }),
            firehose,
        }
    }

    /// Watch every emitted event as it happens.
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.firehose.subscribe()
    }

    pub fn all_event_types() -> Vec<&'static str> {
        vec![
            "AGENT_CREATED",
            "TASK_ASSIGNED",
            "TASK_STATUS_CHANGED",
            "TASK_COMPLETED",
            "REPORT_SUBMITTED",
            "MESSAGE_SENT",
            "AGENT_ERROR",
        ]
    }

    pub async fn subscribe(&self, subscription: EventSubscription) {
        let mut inner = self.inner.write().await;
        inner.subscriptions.push(subscription);
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != subscription_id);
        inner.subscriptions.len() < before
    }

    /// Emit an event: queue it for every matching subscriber.
    pub async fn emit(&self, event: AgentEvent) {
        let mut inner = self.inner.write().await;

        let mut matched_one_shots = Vec::new();
        let mut deliveries = Vec::new();
        for sub in &inner.subscriptions {
            if !sub.event_types.contains(&event.event_type) {
                continue;
            }
            if sub.exclude_self && sub.agent_id == event.agent_id {
                continue;
            }
            deliveries.push(sub.agent_id.clone());
            if sub.one_shot {
                matched_one_shots.push(sub.id.clone());
            }
        }

        for agent_id in deliveries {
            inner.pending.entry(agent_id).or_default().push(event.clone());
        }
        inner
            .subscriptions
            .retain(|s| !matched_one_shots.contains(&s.id));

        let _ = self.firehose.send(event.clone());

        tracing::debug!(
            "[EventBus] {} from {} in {}",
            event.event_type.as_str(),
            event.agent_id,
            event.workspace_id
        );
    }

    /// Drain and return an agent's queued events.
    pub async fn drain_pending_events(&self, agent_id: &str) -> Vec<AgentEvent> {
        let mut inner = self.inner.write().await;
        inner.pending.remove(agent_id).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: AgentEventType, agent_id: &str) -> AgentEvent {
        AgentEvent {
            event_type,
            agent_id: agent_id.to_string(),
            workspace_id: "default".to_string(),
            data: serde_json::json!({}),
            timestamp: Utc::now(),
        }
    }

    fn subscription(id: &str, agent_id: &str, one_shot: bool) -> EventSubscription {
        EventSubscription {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            agent_name: agent_id.to_string(),
            event_types: vec![AgentEventType::TaskCompleted],
            exclude_self: true,
            one_shot,
            wait_group_id: None,
            priority: 0,
        }
    }

    #[tokio::test]
    async fn queues_matching_events_and_drains_once() {
        let bus = EventBus::new();
        bus.subscribe(subscription("s1", "watcher", false)).await;

        bus.emit(event(AgentEventType::TaskCompleted, "worker")).await;
        bus.emit(event(AgentEventType::TaskAssigned, "worker")).await; // filtered

        let drained = bus.drain_pending_events("watcher").await;
        assert_eq!(drained.len(), 1);
        assert!(bus.drain_pending_events("watcher").await.is_empty());
    }

    #[tokio::test]
    async fn exclude_self_skips_own_events() {
        let bus = EventBus::new();
        bus.subscribe(subscription("s1", "watcher", false)).await;
        bus.emit(event(AgentEventType::TaskCompleted, "watcher")).await;
        assert!(bus.drain_pending_events("watcher").await.is_empty());
    }

    #[tokio::test]
    async fn one_shot_subscription_fires_once() {
        let bus = EventBus::new();
        bus.subscribe(subscription("s1", "watcher", true)).await;
        bus.emit(event(AgentEventType::TaskCompleted, "worker")).await;
        bus.emit(event(AgentEventType::TaskCompleted, "worker")).await;
        assert_eq!(bus.drain_pending_events("watcher").await.len(), 1);
    }
}
