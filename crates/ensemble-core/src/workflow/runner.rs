//! Workflow runner — turns a definition into queued background tasks.
//!
//! Consecutive steps sharing a `parallel_group` form one group; groups are
//! serialized by giving every step's task a dependency on all task ids from
//! prior groups. The background engine then drains them in dependency order.
//! Step fan-out happens in a single batch so a run is either fully enqueued
//! or not at all.

use std::collections::HashMap;

use crate::error::ServerError;
use crate::models::background_task::{BackgroundTask, TaskPriority, TriggerSource};
use crate::models::workflow_run::WorkflowRun;
use crate::store::{BackgroundTaskStore, WorkflowRunStore};
use crate::workflow::schema::{WorkflowDefinition, WorkflowStep};

pub struct WorkflowRunner {
    background_store: BackgroundTaskStore,
    run_store: WorkflowRunStore,
    /// Default provider for steps that don't name one.
    default_provider: String,
}

impl WorkflowRunner {
    pub fn new(background_store: BackgroundTaskStore, run_store: WorkflowRunStore) -> Self {
        Self {
            background_store,
            run_store,
            default_provider: "anthropic-api".to_string(),
        }
    }

    /// Enqueue a workflow: create the run row and one background task per
    /// step, wired with cross-group dependencies.
    pub async fn start_run(
        &self,
        definition: &WorkflowDefinition,
        workspace_id: &str,
        trigger_source: TriggerSource,
        trigger_payload: Option<String>,
    ) -> Result<WorkflowRun, ServerError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let run = WorkflowRun::new(
            run_id.clone(),
            definition.name.to_lowercase().replace(' ', "-"),
            definition.name.clone(),
            definition.version.clone(),
            workspace_id.to_string(),
            trigger_source.as_str().to_string(),
            trigger_payload.clone(),
            definition.steps.len() as i64,
        );
        self.run_store.save(&run).await?;

        let groups = group_steps(&definition.steps);
        let mut prior_task_ids: Vec<String> = Vec::new();
        let mut all_tasks = Vec::new();

        for group in &groups {
            let mut group_task_ids = Vec::new();
            for step in group {
                let task_id = uuid::Uuid::new_v4().to_string();
                let prompt = substitute_variables(
                    step.input.as_deref().unwrap_or(""),
                    &definition.variables,
                    trigger_payload.as_deref(),
                );
                let prompt = if prompt.is_empty() {
                    format!("Execute workflow step \"{}\" as {}.", step.name, step.specialist)
                } else {
                    prompt
                };

                let mut task = BackgroundTask::new(
                    task_id.clone(),
                    format!("[Workflow {}] {}", definition.name, step.name),
                    prompt,
                    step.provider
                        .clone()
                        .unwrap_or_else(|| self.default_provider.clone()),
                    workspace_id.to_string(),
                    definition.name.clone(),
                    TriggerSource::Workflow,
                    step.priority
                        .as_deref()
                        .map(TaskPriority::from_str)
                        .unwrap_or(TaskPriority::Normal),
                );
                task.workflow_run_id = Some(run_id.clone());
                task.workflow_step_name = Some(step.name.clone());
                if !prior_task_ids.is_empty() {
                    task.depends_on_task_ids = Some(prior_task_ids.clone());
                }

                group_task_ids.push(task_id);
                all_tasks.push(task);
            }
            prior_task_ids.extend(group_task_ids);
        }

        for task in &all_tasks {
            self.background_store.save(task).await?;
        }

        if let Some(first) = definition.steps.first() {
            self.run_store.mark_running(&run_id, &first.name).await?;
        }

        tracing::info!(
            "[WorkflowRunner] Enqueued workflow \"{}\" as run {} ({} steps, {} groups)",
            definition.name,
            run_id,
            definition.steps.len(),
            groups.len()
        );

        self.run_store
            .get(&run_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Workflow run not found: {}", run_id)))
    }

    /// Record one finished step on the run. Called by the background engine
    /// when a workflow-linked task completes.
    pub async fn record_step_result(
        &self,
        run_id: &str,
        step_name: &str,
        output: &str,
    ) -> Result<(), ServerError> {
        // The next step is whichever queued sibling remains.
        let remaining = self
            .background_store
            .list_by_workflow_run(run_id)
            .await?
            .into_iter()
            .find(|t| !t.status.is_terminal() && t.workflow_step_name.as_deref() != Some(step_name))
            .and_then(|t| t.workflow_step_name);

        self.run_store
            .record_step_completion(run_id, step_name, output, remaining.as_deref())
            .await
    }

    /// Fail the whole run when one of its steps fails.
    pub async fn record_step_failure(
        &self,
        run_id: &str,
        step_name: &str,
        error: &str,
    ) -> Result<(), ServerError> {
        self.run_store
            .mark_failed(run_id, &format!("Step \"{}\" failed: {}", step_name, error))
            .await
    }
}

/// Group consecutive steps that share a `parallel_group`; every other step is
/// its own group.
pub fn group_steps(steps: &[WorkflowStep]) -> Vec<Vec<&WorkflowStep>> {
    let mut groups: Vec<Vec<&WorkflowStep>> = Vec::new();
    for step in steps {
        match (&step.parallel_group, groups.last_mut()) {
            (Some(group_name), Some(last)) => {
                let same_group = last
                    .first()
                    .and_then(|s| s.parallel_group.as_ref())
                    .map(|g| g == group_name)
                    .unwrap_or(false);
                if same_group {
                    last.push(step);
                } else {
                    groups.push(vec![step]);
                }
            }
            _ => groups.push(vec![step]),
        }
    }
    groups
}

/// Resolve `${trigger.payload}`, `${variables.<key>}`, and `${<key>}` in an
/// input template. Unknown references are left verbatim.
pub fn substitute_variables(
    template: &str,
    variables: &HashMap<String, String>,
    trigger_payload: Option<&str>,
) -> String {
    let mut result = template.to_string();

    if let Some(payload) = trigger_payload {
        result = result.replace("${trigger.payload}", payload);
    }

    let var_re = regex::Regex::new(r"\$\{variables\.([^}]+)\}").expect("static regex");
    result = var_re
        .replace_all(&result, |caps: &regex::Captures| {
            let key = &caps[1];
            variables
                .get(key)
                .cloned()
                .unwrap_or_else(|| format!("${{variables.{}}}", key))
        })
        .to_string();

    let generic_re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    result = generic_re
        .replace_all(&result, |caps: &regex::Captures| {
            let key = &caps[1];
            variables
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
                .unwrap_or_else(|| format!("${{{}}}", key))
        })
        .to_string();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::background_task::BackgroundTaskStatus;

    fn step(name: &str, group: Option<&str>) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            specialist: "crafter".to_string(),
            provider: None,
            input: Some(format!("do {}", name)),
            parallel_group: group.map(|g| g.to_string()),
            priority: None,
        }
    }

    #[test]
    fn groups_consecutive_parallel_steps() {
        let steps = vec![
            step("a", None),
            step("b", Some("g1")),
            step("c", Some("g1")),
            step("d", None),
            step("e", Some("g2")),
        ];
        let groups = group_steps(&steps);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[1].len(), 2);
        assert_eq!(groups[2].len(), 1);
        assert_eq!(groups[3].len(), 1);
    }

    #[test]
    fn substitution_resolves_payload_and_variables() {
        let mut vars = HashMap::new();
        vars.insert("repo".to_string(), "acme/widgets".to_string());

        let result = substitute_variables(
            "Issue: ${trigger.payload} in ${variables.repo} (${repo})",
            &vars,
            Some("bug #42"),
        );
        assert_eq!(result, "Issue: bug #42 in acme/widgets (acme/widgets)");

        // Unknown references stay put.
        assert_eq!(
            substitute_variables("${variables.missing}", &vars, None),
            "${variables.missing}"
        );
    }

    #[tokio::test]
    async fn start_run_wires_cross_group_dependencies() {
        let db = Database::open_in_memory().expect("in-memory db");
        let background_store = BackgroundTaskStore::new(db.clone());
        let runner = WorkflowRunner::new(background_store.clone(), WorkflowRunStore::new(db));

        let definition = WorkflowDefinition::from_yaml(
            r#"
name: "Pipeline"
steps:
  - name: "refine"
    specialist: "issue-refiner"
    input: "${trigger.payload}"
  - name: "implement"
    specialist: "crafter"
    parallel_group: "build"
  - name: "test"
    specialist: "crafter"
    parallel_group: "build"
  - name: "verify"
    specialist: "gate"
"#,
        )
        .unwrap();

        let run = runner
            .start_run(&definition, "default", TriggerSource::Manual, Some("payload".into()))
            .await
            .unwrap();
        assert_eq!(run.total_steps, 4);

        let tasks = background_store.list_by_workflow_run(&run.id).await.unwrap();
        assert_eq!(tasks.len(), 4);

        let by_step = |name: &str| {
            tasks
                .iter()
                .find(|t| t.workflow_step_name.as_deref() == Some(name))
                .unwrap()
        };

        assert!(by_step("refine").depends_on_task_ids.is_none());
        assert_eq!(by_step("refine").prompt, "payload");
        // Both parallel steps depend only on the first group.
        assert_eq!(
            by_step("implement").depends_on_task_ids.as_ref().unwrap().len(),
            1
        );
        assert_eq!(
            by_step("test").depends_on_task_ids.as_ref().unwrap().len(),
            1
        );
        // The verify step depends on everything before it.
        assert_eq!(
            by_step("verify").depends_on_task_ids.as_ref().unwrap().len(),
            3
        );

        // Only the first group is claimable until it completes.
        let claimed = background_store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(claimed.workflow_step_name.as_deref(), Some("refine"));
        assert!(background_store.claim_next_ready().await.unwrap().is_none());
        background_store.mark_completed(&claimed.id, None).await.unwrap();
        let next = background_store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(next.status, BackgroundTaskStatus::Running);
        assert!(next.workflow_step_name.as_deref() == Some("implement")
            || next.workflow_step_name.as_deref() == Some("test"));
    }

    #[tokio::test]
    async fn step_results_advance_the_run() {
        let db = Database::open_in_memory().expect("in-memory db");
        let background_store = BackgroundTaskStore::new(db.clone());
        let run_store = WorkflowRunStore::new(db);
        let runner = WorkflowRunner::new(background_store, run_store.clone());

        let definition = WorkflowDefinition::from_yaml(
            r#"
name: "Two Step"
steps:
  - name: "one"
    specialist: "crafter"
  - name: "two"
    specialist: "gate"
"#,
        )
        .unwrap();

        let run = runner
            .start_run(&definition, "default", TriggerSource::Manual, None)
            .await
            .unwrap();

        runner.record_step_result(&run.id, "one", "output-1").await.unwrap();
        let run_now = run_store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(run_now.completed_steps, 1);
        assert_eq!(run_now.step_outputs.get("one").unwrap(), "output-1");

        runner.record_step_result(&run.id, "two", "output-2").await.unwrap();
        let run_now = run_store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(run_now.completed_steps, 2);
        assert!(run_now.status.is_terminal());

        // Terminal runs reject further mutation.
        let err = runner
            .record_step_result(&run.id, "one", "again")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));
    }
}
