//! YAML schema types for workflow definitions.
//!
//! A workflow YAML defines a multi-step agent pipeline:
//!
//! ```yaml
//! name: "SDLC Flow"
//! description: "End-to-end software development lifecycle"
//! version: "1.0"
//!
//! trigger:
//!   type: manual      # manual | webhook | schedule
//!
//! variables:
//!   repo: "acme/widgets"
//!
//! steps:
//!   - name: "Refine Requirements"
//!     specialist: "issue-refiner"
//!     input: "${trigger.payload}"
//!
//!   - name: "Implement"
//!     specialist: "crafter"
//!     input: "Implement the refined requirements for ${variables.repo}"
//!     parallel_group: "build"
//!
//!   - name: "Write Tests"
//!     specialist: "crafter"
//!     input: "Write tests for ${variables.repo}"
//!     parallel_group: "build"
//!
//!   - name: "Verify"
//!     specialist: "gate"
//!     input: "Verify the implementation"
//! ```
//!
//! Consecutive steps sharing a `parallel_group` run concurrently; groups are
//! serialized against each other.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Variable substitution map for `${variables.X}` / `${X}` references.
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Ordered list of workflow steps.
    pub steps: Vec<WorkflowStep>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Trigger configuration — how/when the workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriggerConfig {
    /// "manual", "webhook", "schedule"
    #[serde(rename = "type", default = "default_trigger_type")]
    pub trigger_type: String,

    /// For webhook triggers: the event source (e.g. "github").
    #[serde(default)]
    pub source: Option<String>,

    /// For webhook triggers: the event name (e.g. "issues.opened").
    #[serde(default)]
    pub event: Option<String>,
}

fn default_trigger_type() -> String {
    "manual".to_string()
}

/// A single step in the workflow pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name (unique within the workflow).
    pub name: String,

    /// Specialist ID driving this step.
    pub specialist: String,

    /// Provider for the step's detached session; engine default when absent.
    #[serde(default)]
    pub provider: Option<String>,

    /// Input template — supports `${trigger.payload}`, `${variables.<key>}`
    /// and `${<key>}` substitution.
    #[serde(default)]
    pub input: Option<String>,

    /// Steps in the same group run concurrently.
    #[serde(default)]
    pub parallel_group: Option<String>,

    /// Queue priority for the step's background task.
    #[serde(default)]
    pub priority: Option<String>,
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse workflow YAML: {}", e))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read workflow file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_workflow() {
        let yaml = r#"
name: "Test Flow"
steps:
  - name: "Step 1"
    specialist: "developer"
    input: "Hello, world!"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "Test Flow");
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].specialist, "developer");
        assert_eq!(wf.trigger.trigger_type, "manual");
    }

    #[test]
    fn parse_workflow_with_parallel_groups() {
        let yaml = r#"
name: "SDLC Flow"
description: "End-to-end development"
version: "2.0"
trigger:
  type: webhook
  source: github
  event: issues.opened
variables:
  repo: "acme/widgets"
steps:
  - name: "Refine"
    specialist: "issue-refiner"
    input: "${trigger.payload}"
  - name: "Implement"
    specialist: "crafter"
    input: "Implement for ${variables.repo}"
    parallel_group: "build"
  - name: "Test"
    specialist: "crafter"
    parallel_group: "build"
  - name: "Verify"
    specialist: "gate"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.version, "2.0");
        assert_eq!(wf.trigger.source, Some("github".to_string()));
        assert_eq!(wf.steps.len(), 4);
        assert_eq!(wf.steps[1].parallel_group.as_deref(), Some("build"));
        assert_eq!(wf.steps[2].parallel_group.as_deref(), Some("build"));
    }
}
