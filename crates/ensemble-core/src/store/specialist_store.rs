use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::agent::{AgentRole, ModelTier};
use crate::models::specialist::{Specialist, SpecialistSource};

/// Database-backed specialists (source = user). File and hardcoded
/// specialists live in the registry, not here.
#[derive(Clone)]
pub struct SpecialistStore {
    db: Database,
}

impl SpecialistStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, specialist: &Specialist) -> Result<(), ServerError> {
        let s = specialist.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO specialists (id, name, description, role, default_model_tier,
                     system_prompt, role_reminder, model, enabled, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       description = excluded.description,
                       role = excluded.role,
                       default_model_tier = excluded.default_model_tier,
                       system_prompt = excluded.system_prompt,
                       role_reminder = excluded.role_reminder,
                       model = excluded.model,
                       enabled = excluded.enabled,
                       source = excluded.source,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        s.id,
                        s.name,
                        s.description,
                        s.role.as_str(),
                        s.default_model_tier.as_str(),
                        s.system_prompt,
                        s.role_reminder,
                        s.model,
                        s.enabled as i32,
                        s.source.as_str(),
                        Utc::now().timestamp_millis(),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Specialist>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_specialist(row)))
                    .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Specialist>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_specialist(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM specialists WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }
}

const SELECT: &str = "SELECT id, name, description, role, default_model_tier, system_prompt,
    role_reminder, model, enabled, source FROM specialists";

use rusqlite::Row;

fn row_to_specialist(row: &Row<'_>) -> Specialist {
    Specialist {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or(None),
        role: AgentRole::from_str(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(AgentRole::Developer),
        default_model_tier: ModelTier::from_str(&row.get::<_, String>(4).unwrap_or_default())
            .unwrap_or(ModelTier::Smart),
        system_prompt: row.get(5).unwrap_or_default(),
        role_reminder: row.get(6).unwrap_or_default(),
        model: row.get(7).unwrap_or(None),
        enabled: row.get::<_, i32>(8).unwrap_or(1) != 0,
        source: SpecialistSource::from_str(&row.get::<_, String>(9).unwrap_or_default()),
    }
}
