pub mod agent;
pub mod background_task;
pub mod codebase;
pub mod message;
pub mod note;
pub mod specialist;
pub mod task;
pub mod webhook;
pub mod workflow_run;
pub mod workspace;

pub use agent::{Agent, AgentRole, AgentStatus, ModelTier};
pub use background_task::{BackgroundTask, BackgroundTaskStatus, TaskPriority, TriggerSource};
pub use codebase::Codebase;
pub use message::{Message, MessageRole};
pub use note::{Note, NoteMetadata, NoteType, SPEC_NOTE_ID};
pub use specialist::{Specialist, SpecialistSource};
pub use task::{Task, TaskStatus, VerificationVerdict};
pub use webhook::{TriggerOutcome, WebhookConfig, WebhookTriggerLog};
pub use workflow_run::{WorkflowRun, WorkflowRunStatus};
pub use workspace::{Workspace, WorkspaceStatus};
