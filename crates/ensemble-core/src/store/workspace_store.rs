use chrono::Utc;
use rusqlite::OptionalExtension;
use std::collections::HashMap;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::workspace::{Workspace, WorkspaceStatus};

#[derive(Clone)]
pub struct WorkspaceStore {
    db: Database,
}

impl WorkspaceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, workspace: &Workspace) -> Result<(), ServerError> {
        let ws = workspace.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workspaces (id, title, status, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                       title = excluded.title,
                       status = excluded.status,
                       metadata = excluded.metadata,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        ws.id,
                        ws.title,
                        ws.status.as_str(),
                        serde_json::to_string(&ws.metadata).unwrap_or_default(),
                        ws.created_at.timestamp_millis(),
                        ws.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workspace>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, status, metadata, created_at, updated_at
                     FROM workspaces WHERE id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_workspace(row)))
                    .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Workspace>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, status, metadata, created_at, updated_at
                     FROM workspaces ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_workspace(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update_status(&self, id: &str, status: &WorkspaceStatus) -> Result<(), ServerError> {
        let id = id.to_string();
        let status = status.as_str().to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workspaces SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Delete a workspace. Foreign keys cascade to codebases, agents, tasks,
    /// notes, and adapter sessions.
    pub async fn delete(&self, id: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM workspaces WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }

    pub async fn ensure_default(&self) -> Result<Workspace, ServerError> {
        if let Some(ws) = self.get("default").await? {
            return Ok(ws);
        }
        let ws = Workspace::new("default".to_string(), "Default Workspace".to_string(), None);
        self.save(&ws).await?;
        Ok(ws)
    }
}

use rusqlite::Row;

fn row_to_workspace(row: &Row<'_>) -> Workspace {
    let metadata_str: String = row.get(3).unwrap_or_default();
    let metadata: HashMap<String, String> = serde_json::from_str(&metadata_str).unwrap_or_default();
    let created_ms: i64 = row.get(4).unwrap_or(0);
    let updated_ms: i64 = row.get(5).unwrap_or(0);

    Workspace {
        id: row.get(0).unwrap_or_default(),
        title: row.get(1).unwrap_or_default(),
        status: WorkspaceStatus::from_str(&row.get::<_, String>(2).unwrap_or_default()),
        metadata,
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}
