use serde::{Deserialize, Serialize};

use crate::models::agent::{AgentRole, ModelTier};

/// Where a specialist definition came from. Resolution priority is
/// database-user > file-user > file-bundled > hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SpecialistSource {
    User,
    Bundled,
    Hardcoded,
}

impl SpecialistSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bundled => "bundled",
            Self::Hardcoded => "hardcoded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "bundled" => Self::Bundled,
            _ => Self::Hardcoded,
        }
    }
}

/// A named agent role configuration: system prompt, reminder, tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specialist {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub role: AgentRole,
    pub default_model_tier: ModelTier,
    pub system_prompt: String,
    pub role_reminder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub enabled: bool,
    pub source: SpecialistSource,
}
