use chrono::Utc;
use rusqlite::OptionalExtension;
use std::collections::HashMap;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::workflow_run::{WorkflowRun, WorkflowRunStatus};

#[derive(Clone)]
pub struct WorkflowRunStore {
    db: Database,
}

impl WorkflowRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, run: &WorkflowRun) -> Result<(), ServerError> {
        let r = run.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_runs (id, workflow_id, workflow_name, workflow_version,
                     workspace_id, status, trigger_source, trigger_payload, current_step_name,
                     step_outputs, total_steps, completed_steps, error_message, started_at,
                     completed_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                     ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       current_step_name = excluded.current_step_name,
                       step_outputs = excluded.step_outputs,
                       completed_steps = excluded.completed_steps,
                       error_message = excluded.error_message,
                       started_at = excluded.started_at,
                       completed_at = excluded.completed_at,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.workflow_name,
                        r.workflow_version,
                        r.workspace_id,
                        r.status.as_str(),
                        r.trigger_source,
                        r.trigger_payload,
                        r.current_step_name,
                        serde_json::to_string(&r.step_outputs).unwrap_or_default(),
                        r.total_steps,
                        r.completed_steps,
                        r.error_message,
                        r.started_at.map(|d| d.timestamp_millis()),
                        r.completed_at.map(|d| d.timestamp_millis()),
                        r.created_at.timestamp_millis(),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowRun>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_run(row)))
                    .optional()
            })
            .await
    }

    pub async fn list_by_workspace(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, ServerError> {
        let ws_id = workspace_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE workspace_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![ws_id, limit as i64], |row| {
                        Ok(row_to_run(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Record a finished step: store its output, advance progress, clear or
    /// update the current step name. Terminal runs are never mutated.
    pub async fn record_step_completion(
        &self,
        run_id: &str,
        step_name: &str,
        output: &str,
        next_step: Option<&str>,
    ) -> Result<(), ServerError> {
        let run = self
            .get(run_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Workflow run not found: {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "Workflow run {} is terminal ({})",
                run_id,
                run.status.as_str()
            )));
        }

        let mut run = run;
        run.step_outputs
            .insert(step_name.to_string(), output.to_string());
        run.completed_steps = (run.completed_steps + 1).min(run.total_steps);
        run.current_step_name = next_step.map(|s| s.to_string());
        if run.completed_steps >= run.total_steps {
            run.status = WorkflowRunStatus::Completed;
            run.completed_at = Some(Utc::now());
        }
        self.save(&run).await
    }

    pub async fn mark_running(&self, run_id: &str, first_step: &str) -> Result<(), ServerError> {
        let run = self
            .get(run_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Workflow run not found: {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "Workflow run {} is terminal ({})",
                run_id,
                run.status.as_str()
            )));
        }
        let mut run = run;
        run.status = WorkflowRunStatus::Running;
        run.current_step_name = Some(first_step.to_string());
        run.started_at = Some(Utc::now());
        self.save(&run).await
    }

    pub async fn mark_failed(&self, run_id: &str, error: &str) -> Result<(), ServerError> {
        let run = self
            .get(run_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Workflow run not found: {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "Workflow run {} is terminal ({})",
                run_id,
                run.status.as_str()
            )));
        }
        let mut run = run;
        run.status = WorkflowRunStatus::Failed;
        run.error_message = Some(error.to_string());
        run.completed_at = Some(Utc::now());
        self.save(&run).await
    }
}

const SELECT: &str = "SELECT id, workflow_id, workflow_name, workflow_version, workspace_id,
    status, trigger_source, trigger_payload, current_step_name, step_outputs, total_steps,
    completed_steps, error_message, started_at, completed_at, created_at, updated_at
    FROM workflow_runs";

use rusqlite::Row;

fn row_to_run(row: &Row<'_>) -> WorkflowRun {
    let step_outputs: HashMap<String, String> = row
        .get::<_, Option<String>>(9)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    WorkflowRun {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        workflow_name: row.get(2).unwrap_or_default(),
        workflow_version: row.get(3).unwrap_or_default(),
        workspace_id: row.get(4).unwrap_or_default(),
        status: WorkflowRunStatus::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(WorkflowRunStatus::Pending),
        trigger_source: row.get(6).unwrap_or_default(),
        trigger_payload: row.get(7).unwrap_or(None),
        current_step_name: row.get(8).unwrap_or(None),
        step_outputs,
        total_steps: row.get(10).unwrap_or(0),
        completed_steps: row.get(11).unwrap_or(0),
        error_message: row.get(12).unwrap_or(None),
        started_at: row
            .get::<_, Option<i64>>(13)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
        completed_at: row
            .get::<_, Option<i64>>(14)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
        created_at: chrono::DateTime::from_timestamp_millis(row.get(15).unwrap_or(0))
            .unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(row.get(16).unwrap_or(0))
            .unwrap_or_else(Utc::now),
    }
}
