//! Specialist registry.
//!
//! Specialists come from four sources, merged with this priority:
//! database rows (user) > user YAML/markdown files > bundled files >
//! hardcoded fallbacks. The merged view is cached process-wide; every write
//! path calls `invalidate()`.
//!
//! File formats: plain YAML, or markdown with YAML frontmatter
//! (`--- ... ---` then the system prompt as the body).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::ServerError;
use crate::models::agent::{AgentRole, ModelTier};
use crate::models::specialist::{Specialist, SpecialistSource};
use crate::store::SpecialistStore;

pub struct SpecialistRegistry {
    store: SpecialistStore,
    /// User-owned specialist directories (highest file priority).
    user_dirs: Vec<PathBuf>,
    /// Bundled directory shipped with the deployment.
    bundled_dir: Option<PathBuf>,
    cache: RwLock<Option<HashMap<String, Specialist>>>,
}

impl SpecialistRegistry {
    pub fn new(store: SpecialistStore) -> Self {
        let mut user_dirs = vec![PathBuf::from("specialists")];
        if let Some(home) = dirs::home_dir() {
            user_dirs.push(home.join(".ensemble").join("specialists"));
        }
        Self {
            store,
            user_dirs,
            bundled_dir: Some(PathBuf::from("resources/specialists")),
            cache: RwLock::new(None),
        }
    }

    pub fn with_dirs(store: SpecialistStore, user_dirs: Vec<PathBuf>, bundled_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            user_dirs,
            bundled_dir,
            cache: RwLock::new(None),
        }
    }

    /// Drop the merged cache; the next lookup rebuilds it.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Resolve a specialist from a role name (upper-case, e.g. "CRAFTER") or
    /// a specialist id (e.g. "crafter", "issue-refiner").
    pub async fn resolve(&self, input: &str) -> Option<Specialist> {
        let merged = self.merged().await;

        if let Some(role) = AgentRole::from_str(input) {
            // The coordinator role never resolves: it doesn't delegate to itself.
            if role == AgentRole::Routa {
                return None;
            }
            let id = input.to_lowercase();
            if let Some(s) = merged.get(&id) {
                return Some(s.clone());
            }
            return merged.values().find(|s| s.role == role).cloned();
        }

        merged.get(&input.to_lowercase()).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<Specialist> {
        self.merged().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Specialist> {
        let mut all: Vec<Specialist> = self.merged().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Persist a user specialist and invalidate the cache.
    pub async fn save(&self, mut specialist: Specialist) -> Result<(), ServerError> {
        specialist.source = SpecialistSource::User;
        self.store.save(&specialist).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServerError> {
        self.store.delete(id).await?;
        self.invalidate().await;
        Ok(())
    }

    async fn merged(&self) -> HashMap<String, Specialist> {
        if let Some(cache) = self.cache.read().await.as_ref() {
            return cache.clone();
        }

        let mut merged: HashMap<String, Specialist> = HashMap::new();

        // Lowest priority first; later inserts overwrite.
        for s in hardcoded_specialists() {
            merged.insert(s.id.clone(), s);
        }
        if let Some(dir) = &self.bundled_dir {
            for s in load_dir(dir, SpecialistSource::Bundled) {
                merged.insert(s.id.clone(), s);
            }
        }
        for dir in &self.user_dirs {
            for s in load_dir(dir, SpecialistSource::User) {
                merged.insert(s.id.clone(), s);
            }
        }
        match self.store.list().await {
            Ok(rows) => {
                for s in rows.into_iter().filter(|s| s.enabled) {
                    merged.insert(s.id.clone(), s);
                }
            }
            Err(e) => {
                tracing::warn!("[SpecialistRegistry] database load failed: {}", e);
            }
        }

        *self.cache.write().await = Some(merged.clone());
        merged
    }
}

// ─── File Loading ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SpecialistFile {
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    model_tier: Option<String>,
    system_prompt: String,
    #[serde(default)]
    role_reminder: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

fn load_dir(dir: &Path, source: SpecialistSource) -> Vec<Specialist> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = match ext {
            "yaml" | "yml" => load_yaml_file(&path),
            "md" => load_markdown_file(&path),
            _ => continue,
        };
        match parsed {
            Ok(mut s) => {
                s.source = source.clone();
                tracing::info!("[SpecialistRegistry] Loaded specialist: {} ({:?})", s.id, path);
                out.push(s);
            }
            Err(e) => {
                tracing::warn!("[SpecialistRegistry] Skipping {:?}: {}", path, e);
            }
        }
    }
    out
}

fn load_yaml_file(path: &Path) -> Result<Specialist, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    let file: SpecialistFile = serde_yaml::from_str(&content)
        .map_err(|e| format!("Failed to parse specialist YAML: {}", e))?;
    Ok(file_to_specialist(file, path))
}

/// Markdown with YAML frontmatter; the body is the system prompt.
fn load_markdown_file(path: &Path) -> Result<Specialist, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;

    let parts: Vec<&str> = content.splitn(3, "---").collect();
    if parts.len() < 3 {
        return Err("missing YAML frontmatter".to_string());
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct FrontMatter {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        model_tier: Option<String>,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        role_reminder: Option<String>,
    }

    let fm: FrontMatter = serde_yaml::from_str(parts[1].trim())
        .map_err(|e| format!("Failed to parse frontmatter: {}", e))?;

    let file = SpecialistFile {
        id: None,
        name: fm.name,
        description: fm.description,
        role: fm.role,
        model_tier: fm.model_tier,
        system_prompt: parts[2].trim().to_string(),
        role_reminder: fm.role_reminder,
        model: None,
    };
    Ok(file_to_specialist(file, path))
}

fn file_to_specialist(file: SpecialistFile, path: &Path) -> Specialist {
    let id = file.id.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    });
    Specialist {
        id,
        name: file.name,
        description: file.description,
        role: file
            .role
            .as_deref()
            .and_then(AgentRole::from_str)
            .unwrap_or(AgentRole::Developer),
        default_model_tier: file
            .model_tier
            .as_deref()
            .and_then(ModelTier::from_str)
            .unwrap_or(ModelTier::Smart),
        system_prompt: file.system_prompt,
        role_reminder: file.role_reminder.unwrap_or_default(),
        model: file.model,
        enabled: true,
        source: SpecialistSource::Hardcoded, // overwritten by caller
    }
}

// ─── Hardcoded Fallbacks ────────────────────────────────────────────────

const CRAFTER_SYSTEM_PROMPT: &str = r#"## Crafter (Implementor)

Implement your assigned task — nothing more, nothing less. Produce minimal, clean changes.

## Hard Rules
1. **No scope creep** — only what the task asks
2. **No refactors** — if needed, report to parent for a separate task
3. **Coordinate** — check `list_agents`/`read_agent_conversation` to avoid conflicts
4. **Notes only** — don't create markdown files for collaboration
5. **Don't delegate** — message parent coordinator if blocked

## Completion (REQUIRED)
When done, you MUST call `report_to_parent` with:
- summary: 1-3 sentences of what you did
- success: true/false
- filesModified: list of files you changed
- taskId: the task ID you were assigned
"#;

const CRAFTER_ROLE_REMINDER: &str =
    "Stay within task scope. No refactors, no scope creep. Call report_to_parent when complete.";

const GATE_SYSTEM_PROMPT: &str = r#"## Gate (Verifier)

You verify the implementation against the task's **Acceptance Criteria**.
You are evidence-driven: if you can't point to concrete evidence, it's not verified.

## Hard Rules
1) **Acceptance Criteria is the checklist.** Do not verify against vibes.
2) **No evidence, no verification.** If you can't cite evidence, mark ⚠️ or ❌.
3) **No partial approvals.** "APPROVED" only if every criterion is ✅ VERIFIED.

## Completion (REQUIRED)
Call `report_to_parent` with:
- summary: verdict + confidence, tests run, top 1-3 issues
- success: true only if ALL criteria are VERIFIED
- taskId: the task ID you were verifying
"#;

const GATE_ROLE_REMINDER: &str =
    "Verify against Acceptance Criteria ONLY. Be evidence-driven. Call report_to_parent with verdict.";

const DEVELOPER_SYSTEM_PROMPT: &str = r#"## Developer

You plan and implement. You write specs first, then implement the work yourself after approval.

## Hard Rules
1. **Spec first, always** — Create/update the spec BEFORE any implementation.
2. **Wait for approval** — Present the plan and STOP. Wait for user approval.
3. **No delegation** — Never use `delegate_task_to_agent`.
"#;

const DEVELOPER_ROLE_REMINDER: &str =
    "You work ALONE — never delegate. Spec first, wait for approval.";

fn hardcoded(id: &str, name: &str, description: &str, role: AgentRole, tier: ModelTier, prompt: &str, reminder: &str) -> Specialist {
    Specialist {
        id: id.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        role,
        default_model_tier: tier,
        system_prompt: prompt.to_string(),
        role_reminder: reminder.to_string(),
        model: None,
        enabled: true,
        source: SpecialistSource::Hardcoded,
    }
}

pub fn hardcoded_specialists() -> Vec<Specialist> {
    vec![
        hardcoded(
            "crafter",
            "Implementor",
            "Executes implementation tasks, writes code",
            AgentRole::Crafter,
            ModelTier::Fast,
            CRAFTER_SYSTEM_PROMPT,
            CRAFTER_ROLE_REMINDER,
        ),
        hardcoded(
            "gate",
            "Verifier",
            "Reviews work and verifies completeness",
            AgentRole::Gate,
            ModelTier::Smart,
            GATE_SYSTEM_PROMPT,
            GATE_ROLE_REMINDER,
        ),
        hardcoded(
            "developer",
            "Developer",
            "Plans then implements itself",
            AgentRole::Developer,
            ModelTier::Smart,
            DEVELOPER_SYSTEM_PROMPT,
            DEVELOPER_ROLE_REMINDER,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn registry() -> SpecialistRegistry {
        let db = Database::open_in_memory().expect("in-memory db");
        SpecialistRegistry::with_dirs(SpecialistStore::new(db), Vec::new(), None)
    }

    #[tokio::test]
    async fn resolves_by_role_name_and_id() {
        let reg = registry();
        let by_role = reg.resolve("CRAFTER").await.unwrap();
        assert_eq!(by_role.id, "crafter");
        assert_eq!(by_role.default_model_tier, ModelTier::Fast);

        let by_id = reg.resolve("gate").await.unwrap();
        assert_eq!(by_id.role, AgentRole::Gate);

        assert!(reg.resolve("nonexistent").await.is_none());
        // Coordinators never delegate to themselves.
        assert!(reg.resolve("ROUTA").await.is_none());
    }

    #[tokio::test]
    async fn database_user_overrides_hardcoded() {
        let reg = registry();
        let mut custom = reg.get("crafter").await.unwrap();
        custom.system_prompt = "custom prompt".to_string();
        reg.save(custom).await.unwrap();

        let resolved = reg.resolve("crafter").await.unwrap();
        assert_eq!(resolved.system_prompt, "custom prompt");
        assert_eq!(resolved.source, SpecialistSource::User);
    }

    #[tokio::test]
    async fn writes_invalidate_cache() {
        let reg = registry();
        // Prime the cache.
        assert!(reg.get("gate").await.is_some());

        let mut gate = reg.get("gate").await.unwrap();
        gate.role_reminder = "fresh".to_string();
        reg.save(gate).await.unwrap();

        assert_eq!(reg.get("gate").await.unwrap().role_reminder, "fresh");
    }
}
