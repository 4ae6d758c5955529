//! Skill metadata supplied to the system prompt.
//!
//! Skills follow progressive disclosure: only a name, a one-line description
//! and where to find the full instructions enter the prompt. Discovery and
//! parsing of skill files happen elsewhere.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

impl SkillMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Source of the skills currently available to an agent.
pub trait SkillCatalog: Send + Sync {
    fn skills(&self) -> Vec<SkillMetadata>;
}

/// A fixed list of skills.
#[derive(Debug, Clone, Default)]
pub struct StaticSkills(pub Vec<SkillMetadata>);

impl SkillCatalog for StaticSkills {
    fn skills(&self) -> Vec<SkillMetadata> {
        self.0.clone()
    }
}
