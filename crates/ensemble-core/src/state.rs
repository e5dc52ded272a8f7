//! Shared application state for servers embedding the core.

use std::sync::Arc;

use crate::acp::SessionManager;
use crate::background::{BackgroundTaskEngine, EngineConfig};
use crate::bridge::EventBridge;
use crate::db::Database;
use crate::events::EventBus;
use crate::orchestration::{Orchestrator, OrchestratorConfig};
use crate::specialists::SpecialistRegistry;
use crate::store::{
    AcpSessionStore, AgentStore, BackgroundTaskStore, CodebaseStore, ConversationStore, NoteStore,
    SpecialistStore, TaskStore, WebhookStore, WorkflowRunStore, WorkspaceStore,
};
use crate::tools::AgentTools;
use crate::triggers::{GithubPoller, WebhookReceiver};
use crate::workflow::WorkflowRunner;

/// Shared state accessible by all API handlers.
pub struct AppStateInner {
    pub db: Database,
    pub workspace_store: WorkspaceStore,
    pub codebase_store: CodebaseStore,
    pub agent_store: AgentStore,
    pub task_store: TaskStore,
    pub note_store: NoteStore,
    pub conversation_store: ConversationStore,
    pub acp_session_store: AcpSessionStore,
    pub background_task_store: BackgroundTaskStore,
    pub workflow_run_store: WorkflowRunStore,
    pub webhook_store: WebhookStore,
    pub bridge: Arc<EventBridge>,
    pub event_bus: Arc<EventBus>,
    pub session_manager: Arc<SessionManager>,
    pub specialists: Arc<SpecialistRegistry>,
    pub tools: Arc<AgentTools>,
    pub orchestrator: Arc<Orchestrator>,
    pub workflow_runner: Arc<WorkflowRunner>,
    pub background_engine: Arc<BackgroundTaskEngine>,
    pub webhook_receiver: Arc<WebhookReceiver>,
    pub poller: Arc<GithubPoller>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database) -> Self {
        let workspace_store = WorkspaceStore::new(db.clone());
        let codebase_store = CodebaseStore::new(db.clone());
        let agent_store = AgentStore::new(db.clone());
        let task_store = TaskStore::new(db.clone());
        let note_store = NoteStore::new(db.clone());
        let conversation_store = ConversationStore::new(db.clone());
        let acp_session_store = AcpSessionStore::new(db.clone());
        let background_task_store = BackgroundTaskStore::new(db.clone());
        let workflow_run_store = WorkflowRunStore::new(db.clone());
        let webhook_store = WebhookStore::new(db.clone());

        let bridge = Arc::new(EventBridge::new());
        let event_bus = Arc::new(EventBus::new());
        let session_manager = Arc::new(SessionManager::new(
            acp_session_store.clone(),
            bridge.clone(),
        ));
        let specialists = Arc::new(SpecialistRegistry::new(SpecialistStore::new(db.clone())));
        let tools = Arc::new(AgentTools::new(
            agent_store.clone(),
            conversation_store.clone(),
            task_store.clone(),
            note_store.clone(),
            event_bus.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            session_manager.clone(),
            agent_store.clone(),
            task_store.clone(),
            specialists.clone(),
            tools.clone(),
            event_bus.clone(),
        ));
        let workflow_runner = Arc::new(WorkflowRunner::new(
            background_task_store.clone(),
            workflow_run_store.clone(),
        ));
        let background_engine = Arc::new(BackgroundTaskEngine::new(
            background_task_store.clone(),
            session_manager.clone(),
            bridge.clone(),
            workflow_runner.clone(),
            EngineConfig::default(),
        ));
        let webhook_receiver = Arc::new(WebhookReceiver::new(
            webhook_store.clone(),
            background_task_store.clone(),
        ));
        let poller = Arc::new(GithubPoller::new(
            webhook_store.clone(),
            webhook_receiver.clone(),
        ));

        Self {
            workspace_store,
            codebase_store,
            agent_store,
            task_store,
            note_store,
            conversation_store,
            acp_session_store,
            background_task_store,
            workflow_run_store,
            webhook_store,
            bridge,
            event_bus,
            session_manager,
            specialists,
            tools,
            orchestrator,
            workflow_runner,
            background_engine,
            webhook_receiver,
            poller,
            db,
        }
    }

    /// Start the long-lived loops: report listener, queue engine, poller.
    pub fn start_services(self: &Arc<Self>) {
        self.orchestrator.start();
        self.background_engine.start();
        self.poller.start();
    }
}
