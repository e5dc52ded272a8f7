//! Workflow definitions and the runner that fans them out onto the
//! background task queue.

pub mod runner;
pub mod schema;

pub use runner::WorkflowRunner;
pub use schema::{TriggerConfig, WorkflowDefinition, WorkflowStep};
