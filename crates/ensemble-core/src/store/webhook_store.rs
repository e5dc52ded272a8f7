use chrono::Utc;
use rusqlite::OptionalExtension;
use std::collections::HashSet;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::webhook::{TriggerOutcome, WebhookConfig, WebhookTriggerLog};

#[derive(Clone)]
pub struct WebhookStore {
    db: Database,
}

impl WebhookStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Configs ──────────────────────────────────────────────────────────

    pub async fn save_config(&self, config: &WebhookConfig) -> Result<(), ServerError> {
        let c = config.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO webhook_configs (id, repo, event_types, label_filter, trigger_agent_id,
                     workspace_id, webhook_secret, github_token, prompt_template, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                       repo = excluded.repo,
                       event_types = excluded.event_types,
                       label_filter = excluded.label_filter,
                       trigger_agent_id = excluded.trigger_agent_id,
                       workspace_id = excluded.workspace_id,
                       webhook_secret = excluded.webhook_secret,
                       github_token = excluded.github_token,
                       prompt_template = excluded.prompt_template,
                       enabled = excluded.enabled,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        c.id,
                        c.repo,
                        serde_json::to_string(&c.event_types).unwrap_or_default(),
                        c.label_filter
                            .as_ref()
                            .map(|v| serde_json::to_string(v).unwrap_or_default()),
                        c.trigger_agent_id,
                        c.workspace_id,
                        c.webhook_secret,
                        c.github_token,
                        c.prompt_template,
                        c.enabled as i32,
                        c.created_at.timestamp_millis(),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_config(&self, id: &str) -> Result<Option<WebhookConfig>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_CONFIG))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_config(row)))
                    .optional()
            })
            .await
    }

    pub async fn list_configs(&self) -> Result<Vec<WebhookConfig>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY created_at DESC", SELECT_CONFIG))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_config(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_enabled_configs(&self) -> Result<Vec<WebhookConfig>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE enabled = 1 ORDER BY created_at DESC",
                    SELECT_CONFIG
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_config(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete_config(&self, id: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM webhook_configs WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }

    // ── Trigger logs ─────────────────────────────────────────────────────

    pub async fn append_log(&self, log: &WebhookTriggerLog) -> Result<(), ServerError> {
        let l = log.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO webhook_trigger_logs (id, config_id, event_type, event_action,
                     payload, background_task_id, signature_valid, outcome, error_message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        l.id,
                        l.config_id,
                        l.event_type,
                        l.event_action,
                        serde_json::to_string(&l.payload).unwrap_or_default(),
                        l.background_task_id,
                        l.signature_valid as i32,
                        l.outcome.as_str(),
                        l.error_message,
                        l.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_logs(
        &self,
        config_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WebhookTriggerLog>, ServerError> {
        let config_filter = config_id.map(|s| s.to_string());
        self.db
            .with_conn_async(move |conn| {
                let rows = match &config_filter {
                    Some(cid) => {
                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE config_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                            SELECT_LOG
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![cid, limit as i64], |row| {
                                Ok(row_to_log(row))
                            })?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "{} ORDER BY created_at DESC LIMIT ?1",
                            SELECT_LOG
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![limit as i64], |row| Ok(row_to_log(row)))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }
}

const SELECT_CONFIG: &str = "SELECT id, repo, event_types, label_filter, trigger_agent_id,
    workspace_id, webhook_secret, github_token, prompt_template, enabled, created_at, updated_at
    FROM webhook_configs";

const SELECT_LOG: &str = "SELECT id, config_id, event_type, event_action, payload,
    background_task_id, signature_valid, outcome, error_message, created_at
    FROM webhook_trigger_logs";

use rusqlite::Row;

fn row_to_config(row: &Row<'_>) -> WebhookConfig {
    let event_types: HashSet<String> = row
        .get::<_, Option<String>>(2)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let label_filter: Option<HashSet<String>> = row
        .get::<_, Option<String>>(3)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());

    WebhookConfig {
        id: row.get(0).unwrap_or_default(),
        repo: row.get(1).unwrap_or_default(),
        event_types,
        label_filter,
        trigger_agent_id: row.get(4).unwrap_or_default(),
        workspace_id: row.get(5).unwrap_or(None),
        webhook_secret: row.get(6).unwrap_or_default(),
        github_token: row.get(7).unwrap_or_default(),
        prompt_template: row.get(8).unwrap_or(None),
        enabled: row.get::<_, i32>(9).unwrap_or(0) != 0,
        created_at: chrono::DateTime::from_timestamp_millis(row.get(10).unwrap_or(0))
            .unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(row.get(11).unwrap_or(0))
            .unwrap_or_else(Utc::now),
    }
}

fn row_to_log(row: &Row<'_>) -> WebhookTriggerLog {
    let payload: serde_json::Value = row
        .get::<_, Option<String>>(4)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);

    WebhookTriggerLog {
        id: row.get(0).unwrap_or_default(),
        config_id: row.get(1).unwrap_or_default(),
        event_type: row.get(2).unwrap_or_default(),
        event_action: row.get(3).unwrap_or(None),
        payload,
        background_task_id: row.get(5).unwrap_or(None),
        signature_valid: row.get::<_, i32>(6).unwrap_or(0) != 0,
        outcome: TriggerOutcome::from_str(&row.get::<_, String>(7).unwrap_or_default()),
        error_message: row.get(8).unwrap_or(None),
        created_at: chrono::DateTime::from_timestamp_millis(row.get(9).unwrap_or(0))
            .unwrap_or_else(Utc::now),
    }
}
