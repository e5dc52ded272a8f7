//! Persistent queue backing the background task engine.
//!
//! `claim_next_ready` is the reservation primitive: it selects the highest
//! priority PENDING task whose dependencies are all COMPLETED and flips it to
//! RUNNING inside a single connection hold, which serializes competing
//! claimers.

use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::background_task::{
    BackgroundTask, BackgroundTaskStatus, TaskPriority, TriggerSource,
};

#[derive(Clone)]
pub struct BackgroundTaskStore {
    db: Database,
}

impl BackgroundTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, task: &BackgroundTask) -> Result<(), ServerError> {
        let t = task.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO background_tasks (id, title, prompt, agent_id, workspace_id, status,
                     triggered_by, trigger_source, priority, result_session_id, error_message,
                     attempts, max_attempts, last_activity, current_activity, tool_call_count,
                     input_tokens, output_tokens, workflow_run_id, workflow_step_name,
                     depends_on_task_ids, task_output, created_at, started_at, completed_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
                     ON CONFLICT(id) DO UPDATE SET
                       title = excluded.title,
                       prompt = excluded.prompt,
                       status = excluded.status,
                       result_session_id = excluded.result_session_id,
                       error_message = excluded.error_message,
                       attempts = excluded.attempts,
                       last_activity = excluded.last_activity,
                       current_activity = excluded.current_activity,
                       tool_call_count = excluded.tool_call_count,
                       input_tokens = excluded.input_tokens,
                       output_tokens = excluded.output_tokens,
                       task_output = excluded.task_output,
                       started_at = excluded.started_at,
                       completed_at = excluded.completed_at,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        t.id,
                        t.title,
                        t.prompt,
                        t.agent_id,
                        t.workspace_id,
                        t.status.as_str(),
                        t.triggered_by,
                        t.trigger_source.as_str(),
                        t.priority.as_str(),
                        t.result_session_id,
                        t.error_message,
                        t.attempts,
                        t.max_attempts,
                        t.last_activity,
                        t.current_activity,
                        t.tool_call_count,
                        t.input_tokens,
                        t.output_tokens,
                        t.workflow_run_id,
                        t.workflow_step_name,
                        t.depends_on_task_ids
                            .as_ref()
                            .map(|v| serde_json::to_string(v).unwrap_or_default()),
                        t.task_output,
                        t.created_at.timestamp_millis(),
                        t.started_at.map(|d| d.timestamp_millis()),
                        t.completed_at.map(|d| d.timestamp_millis()),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<BackgroundTask>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_task(row)))
                    .optional()
            })
            .await
    }

    pub async fn list(
        &self,
        workspace_id: Option<&str>,
        status: Option<&BackgroundTaskStatus>,
        limit: usize,
    ) -> Result<Vec<BackgroundTask>, ServerError> {
        let ws = workspace_id.map(|s| s.to_string());
        let status = status.map(|s| s.as_str().to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut sql = SELECT.to_string();
                let mut clauses = Vec::new();
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(ws) = &ws {
                    params.push(Box::new(ws.clone()));
                    clauses.push(format!("workspace_id = ?{}", params.len()));
                }
                if let Some(st) = &status {
                    params.push(Box::new(st.clone()));
                    clauses.push(format!("status = ?{}", params.len()));
                }
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                params.push(Box::new(limit as i64));
                sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", params.len()));

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_workflow_run(
        &self,
        workflow_run_id: &str,
    ) -> Result<Vec<BackgroundTask>, ServerError> {
        let wid = workflow_run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE workflow_run_id = ?1 ORDER BY created_at ASC",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wid], |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Reserve the next ready task: PENDING, all dependencies COMPLETED,
    /// ordered by priority (HIGH first) then created_at. The winning row is
    /// flipped to RUNNING with `attempts` incremented and `started_at` set.
    pub async fn claim_next_ready(&self) -> Result<Option<BackgroundTask>, ServerError> {
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status = 'PENDING'
                     ORDER BY CASE priority WHEN 'HIGH' THEN 0 WHEN 'NORMAL' THEN 1 ELSE 2 END,
                              created_at ASC",
                    SELECT
                ))?;
                let candidates = stmt
                    .query_map([], |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut completed_stmt =
                    conn.prepare("SELECT 1 FROM background_tasks WHERE id = ?1 AND status = 'COMPLETED'")?;

                for mut candidate in candidates {
                    let deps_ready = match &candidate.depends_on_task_ids {
                        Some(deps) => deps.iter().all(|dep| {
                            completed_stmt
                                .query_row(rusqlite::params![dep], |_| Ok(()))
                                .optional()
                                .map(|r| r.is_some())
                                .unwrap_or(false)
                        }),
                        None => true,
                    };
                    if !deps_ready {
                        continue;
                    }

                    let affected = conn.execute(
                        "UPDATE background_tasks
                         SET status = 'RUNNING', attempts = attempts + 1, started_at = ?1, updated_at = ?1
                         WHERE id = ?2 AND status = 'PENDING'",
                        rusqlite::params![now, candidate.id],
                    )?;
                    if affected == 1 {
                        candidate.status = BackgroundTaskStatus::Running;
                        candidate.attempts += 1;
                        candidate.started_at = chrono::DateTime::from_timestamp_millis(now);
                        return Ok(Some(candidate));
                    }
                }
                Ok(None)
            })
            .await
    }

    pub async fn set_result_session(
        &self,
        id: &str,
        session_id: &str,
    ) -> Result<(), ServerError> {
        let id = id.to_string();
        let sid = session_id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE background_tasks SET result_session_id = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![sid, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Write progress columns fed from bridge events.
    pub async fn update_progress(
        &self,
        id: &str,
        current_activity: Option<&str>,
        tool_call_delta: i64,
        input_tokens_delta: i64,
        output_tokens_delta: i64,
    ) -> Result<(), ServerError> {
        let id = id.to_string();
        let activity = current_activity.map(|s| s.to_string());
        let now = Utc::now();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE background_tasks
                     SET last_activity = ?1,
                         current_activity = COALESCE(?2, current_activity),
                         tool_call_count = tool_call_count + ?3,
                         input_tokens = input_tokens + ?4,
                         output_tokens = output_tokens + ?5,
                         updated_at = ?6
                     WHERE id = ?7",
                    rusqlite::params![
                        now.to_rfc3339(),
                        activity,
                        tool_call_delta,
                        input_tokens_delta,
                        output_tokens_delta,
                        now.timestamp_millis(),
                        id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn mark_completed(&self, id: &str, output: Option<&str>) -> Result<(), ServerError> {
        self.finish(id, BackgroundTaskStatus::Completed, output, None).await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), ServerError> {
        self.finish(id, BackgroundTaskStatus::Failed, None, Some(error)).await
    }

    pub async fn mark_cancelled(&self, id: &str) -> Result<(), ServerError> {
        self.finish(id, BackgroundTaskStatus::Cancelled, None, None).await
    }

    async fn finish(
        &self,
        id: &str,
        status: BackgroundTaskStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), ServerError> {
        let id = id.to_string();
        let status = status.as_str().to_string();
        let output = output.map(|s| s.to_string());
        let error = error.map(|s| s.to_string());
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE background_tasks
                     SET status = ?1, task_output = COALESCE(?2, task_output),
                         error_message = ?3, completed_at = ?4, updated_at = ?4
                     WHERE id = ?5",
                    rusqlite::params![status, output, error, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Re-claim orphans: RUNNING rows without a result session older than the
    /// threshold go back to PENDING, or FAILED once attempts reach the cap.
    /// Returns (requeued, failed) counts.
    pub async fn requeue_orphans(
        &self,
        threshold_minutes: i64,
    ) -> Result<(usize, usize), ServerError> {
        let cutoff = Utc::now().timestamp_millis() - threshold_minutes * 60_000;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let failed = conn.execute(
                    "UPDATE background_tasks
                     SET status = 'FAILED', error_message = 'Orphaned: no session created', completed_at = ?1, updated_at = ?1
                     WHERE status = 'RUNNING' AND result_session_id IS NULL
                       AND started_at < ?2 AND attempts >= max_attempts",
                    rusqlite::params![now, cutoff],
                )?;
                let requeued = conn.execute(
                    "UPDATE background_tasks
                     SET status = 'PENDING', started_at = NULL, updated_at = ?1
                     WHERE status = 'RUNNING' AND result_session_id IS NULL
                       AND started_at < ?2",
                    rusqlite::params![now, cutoff],
                )?;
                Ok((requeued, failed))
            })
            .await
    }
}

const SELECT: &str = "SELECT id, title, prompt, agent_id, workspace_id, status, triggered_by,
    trigger_source, priority, result_session_id, error_message, attempts, max_attempts,
    last_activity, current_activity, tool_call_count, input_tokens, output_tokens,
    workflow_run_id, workflow_step_name, depends_on_task_ids, task_output,
    created_at, started_at, completed_at, updated_at
    FROM background_tasks";

use rusqlite::Row;

fn row_to_task(row: &Row<'_>) -> BackgroundTask {
    let created_ms: i64 = row.get(22).unwrap_or(0);
    let depends: Option<Vec<String>> = row
        .get::<_, Option<String>>(20)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());

    BackgroundTask {
        id: row.get(0).unwrap_or_default(),
        title: row.get(1).unwrap_or_default(),
        prompt: row.get(2).unwrap_or_default(),
        agent_id: row.get(3).unwrap_or_default(),
        workspace_id: row.get(4).unwrap_or_default(),
        status: BackgroundTaskStatus::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(BackgroundTaskStatus::Pending),
        triggered_by: row.get(6).unwrap_or_default(),
        trigger_source: TriggerSource::from_str(&row.get::<_, String>(7).unwrap_or_default()),
        priority: TaskPriority::from_str(&row.get::<_, String>(8).unwrap_or_default()),
        result_session_id: row.get(9).unwrap_or(None),
        error_message: row.get(10).unwrap_or(None),
        attempts: row.get(11).unwrap_or(0),
        max_attempts: row.get(12).unwrap_or(3),
        last_activity: row.get(13).unwrap_or(None),
        current_activity: row.get(14).unwrap_or(None),
        tool_call_count: row.get(15).unwrap_or(0),
        input_tokens: row.get(16).unwrap_or(0),
        output_tokens: row.get(17).unwrap_or(0),
        workflow_run_id: row.get(18).unwrap_or(None),
        workflow_step_name: row.get(19).unwrap_or(None),
        depends_on_task_ids: depends,
        task_output: row.get(21).unwrap_or(None),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        started_at: row
            .get::<_, Option<i64>>(23)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
        completed_at: row
            .get::<_, Option<i64>>(24)
            .unwrap_or(None)
            .and_then(chrono::DateTime::from_timestamp_millis),
        updated_at: chrono::DateTime::from_timestamp_millis(row.get(25).unwrap_or(0))
            .unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: TaskPriority) -> BackgroundTask {
        BackgroundTask::new(
            id.to_string(),
            format!("task {}", id),
            "do something".to_string(),
            "claude".to_string(),
            "default".to_string(),
            "test".to_string(),
            TriggerSource::Manual,
            priority,
        )
    }

    async fn store() -> BackgroundTaskStore {
        let db = Database::open_in_memory().expect("in-memory db");
        BackgroundTaskStore::new(db)
    }

    #[tokio::test]
    async fn claims_high_priority_first() {
        let store = store().await;
        store.save(&task("low", TaskPriority::Low)).await.unwrap();
        store.save(&task("normal", TaskPriority::Normal)).await.unwrap();
        store.save(&task("high", TaskPriority::High)).await.unwrap();

        let claimed = store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(claimed.id, "high");
        assert_eq!(claimed.status, BackgroundTaskStatus::Running);
        assert_eq!(claimed.attempts, 1);

        let next = store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(next.id, "normal");
        let next = store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(next.id, "low");
        assert!(store.claim_next_ready().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dependencies_gate_readiness() {
        let store = store().await;
        let first = task("first", TaskPriority::Normal);
        let mut second = task("second", TaskPriority::High);
        second.depends_on_task_ids = Some(vec!["first".to_string()]);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        // "second" outranks "first" but is blocked by its dependency.
        let claimed = store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(claimed.id, "first");
        assert!(store.claim_next_ready().await.unwrap().is_none());

        store.mark_completed("first", None).await.unwrap();
        let claimed = store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(claimed.id, "second");
    }

    #[tokio::test]
    async fn orphans_are_requeued_then_failed() {
        let store = store().await;
        let mut t = task("orphan", TaskPriority::Normal);
        t.max_attempts = 1;
        store.save(&t).await.unwrap();

        let claimed = store.claim_next_ready().await.unwrap().unwrap();
        assert_eq!(claimed.id, "orphan");

        // Threshold of -1 minutes puts the cutoff in the future, so the
        // just-claimed task is already an orphan; attempts == max_attempts.
        let (requeued, failed) = store.requeue_orphans(-1).await.unwrap();
        assert_eq!(requeued, 0);
        assert_eq!(failed, 1);
        let t = store.get("orphan").await.unwrap().unwrap();
        assert_eq!(t.status, BackgroundTaskStatus::Failed);
    }
}
