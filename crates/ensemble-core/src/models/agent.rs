use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum depth of the delegation tree. A coordinator sits at depth 0;
/// its children at 1; grandchildren at 2 may not delegate further.
pub const MAX_DELEGATION_DEPTH: u32 = 2;

/// Metadata key carrying the string-encoded delegation depth.
pub const META_DELEGATION_DEPTH: &str = "delegationDepth";
/// Metadata key carrying the id of the agent that created this one.
pub const META_CREATED_BY: &str = "createdByAgentId";
/// Metadata key carrying the resolved specialist id.
pub const META_SPECIALIST: &str = "specialist";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentRole {
    /// Coordinator: plans and delegates.
    Routa,
    /// Implementor: executes a single task.
    Crafter,
    /// Verifier: checks work against acceptance criteria.
    Gate,
    /// Plans and implements itself, never delegates.
    Developer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routa => "ROUTA",
            Self::Crafter => "CRAFTER",
            Self::Gate => "GATE",
            Self::Developer => "DEVELOPER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ROUTA" => Some(Self::Routa),
            "CRAFTER" => Some(Self::Crafter),
            "GATE" => Some(Self::Gate),
            "DEVELOPER" => Some(Self::Developer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelTier {
    Fast,
    Balanced,
    Smart,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "FAST",
            Self::Balanced => "BALANCED",
            Self::Smart => "SMART",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "FAST" => Some(Self::Fast),
            "BALANCED" => Some(Self::Balanced),
            "SMART" => Some(Self::Smart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Pending,
    Active,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub model_tier: ModelTier,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: String,
        name: String,
        role: AgentRole,
        workspace_id: String,
        parent_id: Option<String>,
        model_tier: Option<ModelTier>,
        metadata: Option<HashMap<String, String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            role,
            model_tier: model_tier.unwrap_or(ModelTier::Smart),
            workspace_id,
            parent_id,
            status: AgentStatus::Pending,
            metadata: metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Delegation depth from the agent's metadata. Agents without the key
    /// (e.g. user-created coordinators) are at depth 0.
    pub fn delegation_depth(&self) -> u32 {
        self.metadata
            .get(META_DELEGATION_DEPTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}
