//! Store for adapter session persistence.
//!
//! The session row is the durable half of an adapter: enough metadata to
//! rebuild in-process adapters after a cold start, plus the raw update
//! history for replay.

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::ServerError;

/// Adapter session record from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcpSessionRow {
    pub id: String,
    pub name: Option<String>,
    pub cwd: String,
    pub workspace_id: String,
    pub routa_agent_id: Option<String>,
    pub provider: Option<String>,
    pub role: Option<String>,
    pub mode_id: Option<String>,
    pub model: Option<String>,
    pub first_prompt_sent: bool,
    pub message_history: Vec<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct AcpSessionStore {
    db: Database,
}

impl AcpSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a session row.
    pub async fn save(&self, session: &AcpSessionRow) -> Result<(), ServerError> {
        let s = session.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO acp_sessions (id, name, cwd, workspace_id, routa_agent_id, provider,
                     role, mode_id, model, first_prompt_sent, message_history, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       cwd = excluded.cwd,
                       routa_agent_id = excluded.routa_agent_id,
                       provider = excluded.provider,
                       role = excluded.role,
                       mode_id = excluded.mode_id,
                       model = excluded.model,
                       first_prompt_sent = excluded.first_prompt_sent,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        s.id,
                        s.name,
                        s.cwd,
                        s.workspace_id,
                        s.routa_agent_id,
                        s.provider,
                        s.role,
                        s.mode_id,
                        s.model,
                        s.first_prompt_sent as i32,
                        serde_json::to_string(&s.message_history).unwrap_or_default(),
                        s.created_at,
                        s.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Load a session by ID.
    pub async fn get(&self, session_id: &str) -> Result<Option<AcpSessionRow>, ServerError> {
        let id = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
                stmt.query_row([&id], row_to_session).optional()
            })
            .await
    }

    /// List sessions, optionally filtered by workspace.
    pub async fn list(
        &self,
        workspace_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<AcpSessionRow>, ServerError> {
        let workspace_filter = workspace_id.map(|s| s.to_string());
        let limit = limit.unwrap_or(100);
        self.db
            .with_conn_async(move |conn| {
                let rows = match &workspace_filter {
                    Some(ws) => {
                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE workspace_id = ?1 ORDER BY updated_at DESC LIMIT ?2",
                            SELECT
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![ws, limit as i64], row_to_session)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "{} ORDER BY updated_at DESC LIMIT ?1",
                            SELECT
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![limit as i64], row_to_session)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    /// Append a raw notification to the session's history.
    pub async fn append_history(
        &self,
        session_id: &str,
        notification: serde_json::Value,
    ) -> Result<(), ServerError> {
        let id = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT message_history FROM acp_sessions WHERE id = ?1")?;
                let history_json: Option<String> =
                    stmt.query_row([&id], |row| row.get(0)).optional()?;

                let mut history: Vec<serde_json::Value> = match history_json {
                    Some(json) => serde_json::from_str(&json).unwrap_or_default(),
                    None => return Ok(()), // Session doesn't exist
                };

                history.push(notification);

                let new_history_json = serde_json::to_string(&history).unwrap_or_default();
                let now = chrono::Utc::now().timestamp_millis();
                conn.execute(
                    "UPDATE acp_sessions SET message_history = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![new_history_json, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Load session history.
    pub async fn get_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<serde_json::Value>, ServerError> {
        let id = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT message_history FROM acp_sessions WHERE id = ?1")?;
                let history_json: Option<String> =
                    stmt.query_row([&id], |row| row.get(0)).optional()?;
                Ok(history_json
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_default())
            })
            .await
    }

    pub async fn set_first_prompt_sent(&self, session_id: &str) -> Result<(), ServerError> {
        let id = session_id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE acp_sessions SET first_prompt_sent = 1, updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<(), ServerError> {
        let id = session_id.to_string();
        let mode = mode_id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE acp_sessions SET mode_id = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![mode, now, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), ServerError> {
        let id = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM acp_sessions WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }
}

const SELECT: &str = "SELECT id, name, cwd, workspace_id, routa_agent_id, provider, role, mode_id,
    model, first_prompt_sent, message_history, created_at, updated_at
    FROM acp_sessions";

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<AcpSessionRow, rusqlite::Error> {
    let history_json: String = row.get(10)?;
    let history: Vec<serde_json::Value> = serde_json::from_str(&history_json).unwrap_or_default();

    Ok(AcpSessionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        cwd: row.get(2)?,
        workspace_id: row.get(3)?,
        routa_agent_id: row.get(4)?,
        provider: row.get(5)?,
        role: row.get(6)?,
        mode_id: row.get(7)?,
        model: row.get(8)?,
        first_prompt_sent: row.get::<_, i32>(9)? != 0,
        message_history: history,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
