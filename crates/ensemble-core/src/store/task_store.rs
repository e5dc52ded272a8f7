//! Task persistence with optimistic concurrency.
//!
//! Every write bumps the `version` column. `atomic_update` only applies when
//! the caller's expected version matches the stored one, which serializes
//! concurrent state transitions on the same task.

use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::task::{Task, TaskStatus, VerificationVerdict};

/// Partial update applied by `atomic_update`. Absent fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<String>,
    pub session_id: Option<String>,
    pub completion_summary: Option<String>,
    pub verification_verdict: Option<VerificationVerdict>,
    pub verification_report: Option<String>,
}

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a task. The stored `version` is bumped on update regardless of
    /// the version carried by the caller's copy.
    pub async fn save(&self, task: &Task) -> Result<(), ServerError> {
        let t = task.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, title, objective, scope, acceptance_criteria, verification_commands,
                     assigned_to, status, dependencies, parallel_group, workspace_id, session_id,
                     completion_summary, verification_verdict, verification_report, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                     ON CONFLICT(id) DO UPDATE SET
                       title = excluded.title,
                       objective = excluded.objective,
                       scope = excluded.scope,
                       acceptance_criteria = excluded.acceptance_criteria,
                       verification_commands = excluded.verification_commands,
                       assigned_to = excluded.assigned_to,
                       status = excluded.status,
                       dependencies = excluded.dependencies,
                       parallel_group = excluded.parallel_group,
                       session_id = excluded.session_id,
                       completion_summary = excluded.completion_summary,
                       verification_verdict = excluded.verification_verdict,
                       verification_report = excluded.verification_report,
                       version = tasks.version + 1,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        t.id,
                        t.title,
                        t.objective,
                        t.scope,
                        t.acceptance_criteria
                            .as_ref()
                            .map(|v| serde_json::to_string(v).unwrap_or_default()),
                        t.verification_commands
                            .as_ref()
                            .map(|v| serde_json::to_string(v).unwrap_or_default()),
                        t.assigned_to,
                        t.status.as_str(),
                        serde_json::to_string(&t.dependencies).unwrap_or_default(),
                        t.parallel_group,
                        t.workspace_id,
                        t.session_id,
                        t.completion_summary,
                        t.verification_verdict.as_ref().map(|v| v.as_str()),
                        t.verification_report,
                        t.version,
                        t.created_at.timestamp_millis(),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Apply `patch` iff the stored version equals `expected_version`;
    /// the version is bumped on success.
    pub async fn atomic_update(
        &self,
        task_id: &str,
        expected_version: i64,
        patch: TaskPatch,
    ) -> Result<Task, ServerError> {
        let id = task_id.to_string();
        let now = Utc::now().timestamp_millis();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                let mut sets = vec![
                    "version = version + 1".to_string(),
                    format!("updated_at = {}", now),
                ];
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                let mut idx = 1;
                let mut push = |col: &str, val: Box<dyn rusqlite::ToSql>, sets: &mut Vec<String>, params: &mut Vec<Box<dyn rusqlite::ToSql>>| {
                    sets.push(format!("{} = ?{}", col, idx));
                    params.push(val);
                    idx += 1;
                };

                if let Some(s) = &patch.status {
                    push("status", Box::new(s.as_str().to_string()), &mut sets, &mut params);
                }
                if let Some(a) = &patch.assigned_to {
                    push("assigned_to", Box::new(a.clone()), &mut sets, &mut params);
                }
                if let Some(s) = &patch.session_id {
                    push("session_id", Box::new(s.clone()), &mut sets, &mut params);
                }
                if let Some(s) = &patch.completion_summary {
                    push("completion_summary", Box::new(s.clone()), &mut sets, &mut params);
                }
                if let Some(v) = &patch.verification_verdict {
                    push("verification_verdict", Box::new(v.as_str().to_string()), &mut sets, &mut params);
                }
                if let Some(r) = &patch.verification_report {
                    push("verification_report", Box::new(r.clone()), &mut sets, &mut params);
                }

                let sql = format!(
                    "UPDATE tasks SET {} WHERE id = ?{} AND version = ?{}",
                    sets.join(", "),
                    idx,
                    idx + 1
                );
                params.push(Box::new(id.clone()));
                params.push(Box::new(expected_version));

                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let affected = conn.execute(&sql, param_refs.as_slice())?;
                Ok(affected)
            })
            .await?;

        if updated == 0 {
            return Err(ServerError::VersionConflict(
                task_id.to_string(),
                expected_version,
            ));
        }
        self.get(task_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Task not found: {}", task_id)))
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, ServerError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_task(row)))
                    .optional()
            })
            .await
    }

    pub async fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<Task>, ServerError> {
        let ws_id = workspace_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE workspace_id = ?1 ORDER BY created_at ASC",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![ws_id], |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_assignee(&self, agent_id: &str) -> Result<Vec<Task>, ServerError> {
        let aid = agent_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE assigned_to = ?1 ORDER BY created_at ASC",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![aid], |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_status(
        &self,
        workspace_id: &str,
        status: &TaskStatus,
    ) -> Result<Vec<Task>, ServerError> {
        let ws_id = workspace_id.to_string();
        let status_str = status.as_str().to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE workspace_id = ?1 AND status = ?2 ORDER BY created_at ASC",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![ws_id, status_str], |row| {
                        Ok(row_to_task(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, task_id: &str) -> Result<(), ServerError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }

    /// Create several tasks inside one transaction. Used by spec-note block
    /// conversion so either every block yields a row or none does.
    pub async fn save_batch(&self, tasks: Vec<Task>) -> Result<(), ServerError> {
        self.db
            .with_conn_async(move |conn| {
                conn.execute_batch("BEGIN")?;
                for t in &tasks {
                    let result = conn.execute(
                        "INSERT INTO tasks (id, title, objective, scope, acceptance_criteria,
                         verification_commands, assigned_to, status, dependencies, parallel_group,
                         workspace_id, session_id, completion_summary, verification_verdict,
                         verification_report, version, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                        rusqlite::params![
                            t.id,
                            t.title,
                            t.objective,
                            t.scope,
                            t.acceptance_criteria
                                .as_ref()
                                .map(|v| serde_json::to_string(v).unwrap_or_default()),
                            t.verification_commands
                                .as_ref()
                                .map(|v| serde_json::to_string(v).unwrap_or_default()),
                            t.assigned_to,
                            t.status.as_str(),
                            serde_json::to_string(&t.dependencies).unwrap_or_default(),
                            t.parallel_group,
                            t.workspace_id,
                            t.session_id,
                            t.completion_summary,
                            t.verification_verdict.as_ref().map(|v| v.as_str()),
                            t.verification_report,
                            t.version,
                            t.created_at.timestamp_millis(),
                            t.updated_at.timestamp_millis(),
                        ],
                    );
                    if let Err(e) = result {
                        conn.execute_batch("ROLLBACK")?;
                        return Err(e);
                    }
                }
                conn.execute_batch("COMMIT")?;
                Ok(())
            })
            .await
    }
}

const SELECT: &str = "SELECT id, title, objective, scope, acceptance_criteria, verification_commands,
    assigned_to, status, dependencies, parallel_group, workspace_id, session_id,
    completion_summary, verification_verdict, verification_report, version, created_at, updated_at
    FROM tasks";

use rusqlite::Row;

fn row_to_task(row: &Row<'_>) -> Task {
    let created_ms: i64 = row.get(16).unwrap_or(0);
    let updated_ms: i64 = row.get(17).unwrap_or(0);

    let acceptance_criteria: Option<Vec<String>> = row
        .get::<_, Option<String>>(4)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());
    let verification_commands: Option<Vec<String>> = row
        .get::<_, Option<String>>(5)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());
    let dependencies: Vec<String> = row
        .get::<_, Option<String>>(8)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Task {
        id: row.get(0).unwrap_or_default(),
        title: row.get(1).unwrap_or_default(),
        objective: row.get(2).unwrap_or_default(),
        scope: row.get(3).unwrap_or(None),
        acceptance_criteria,
        verification_commands,
        assigned_to: row.get(6).unwrap_or(None),
        status: TaskStatus::from_str(&row.get::<_, String>(7).unwrap_or_default())
            .unwrap_or(TaskStatus::Pending),
        dependencies,
        parallel_group: row.get(9).unwrap_or(None),
        workspace_id: row.get(10).unwrap_or_default(),
        session_id: row.get(11).unwrap_or(None),
        completion_summary: row.get(12).unwrap_or(None),
        verification_verdict: row
            .get::<_, Option<String>>(13)
            .unwrap_or(None)
            .and_then(|s| VerificationVerdict::from_str(&s)),
        verification_report: row.get(14).unwrap_or(None),
        version: row.get(15).unwrap_or(1),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str) -> Task {
        Task::new(
            id.to_string(),
            "Add hello".to_string(),
            "Add hello.txt".to_string(),
            "default".to_string(),
            None,
            None,
            None,
            None,
            None,
            None,
        )
    }

    async fn store() -> TaskStore {
        let db = Database::open_in_memory().expect("in-memory db");
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workspaces (id, title, status, metadata, created_at, updated_at)
                 VALUES ('default', 'Default', 'active', '{}', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .expect("seed default workspace");
        TaskStore::new(db)
    }

    #[tokio::test]
    async fn atomic_update_succeeds_on_matching_version() {
        let store = store().await;
        store.save(&sample_task("t1")).await.unwrap();

        let patch = TaskPatch {
            status: Some(TaskStatus::InProgress),
            assigned_to: Some("agent-1".to_string()),
            ..Default::default()
        };
        let updated = store.atomic_update("t1", 1, patch).await.unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn atomic_update_rejects_stale_version() {
        let store = store().await;
        store.save(&sample_task("t1")).await.unwrap();

        let patch = TaskPatch {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        };
        store.atomic_update("t1", 1, patch.clone()).await.unwrap();

        // Second update with the stale version must fail.
        let err = store.atomic_update("t1", 1, patch).await.unwrap_err();
        assert!(matches!(err, ServerError::VersionConflict(_, 1)));
    }

    #[tokio::test]
    async fn save_bumps_version_on_every_write() {
        let store = store().await;
        let mut task = sample_task("t1");
        store.save(&task).await.unwrap();

        task.status = TaskStatus::InProgress;
        store.save(&task).await.unwrap();
        let stored = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);

        store.save(&task).await.unwrap();
        let stored = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stored.version, 3);
    }
}
