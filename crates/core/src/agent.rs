//! Agent configuration and state types.

use serde::{Deserialize, Serialize};

/// Configuration for one agent identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address used in `targetAgentId` / `sourceAgentId`
    pub id: String,

    /// Display name used in the system prompt
    #[serde(default = "default_name")]
    pub name: String,

    /// Free-form instructions placed in the system prompt
    #[serde(default)]
    pub instructions: String,

    /// Maximum generation rounds per turn (safety limit)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_name() -> String {
    "Aegis".into()
}

pub fn default_max_iterations() -> u32 {
    10
}

impl AgentConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: default_name(),
            instructions: String::new(),
            max_iterations: default_max_iterations(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

/// Lifecycle of an agent loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Constructed, not yet subscribed
    #[default]
    Idle,
    /// Subscribed and waiting for turns
    Listening,
    /// Running the generation/tool cycle for a turn
    Processing,
    /// Unsubscribed for good
    Stopped,
}

/// Counters collected by an agent loop since it was constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStats {
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub tool_calls: u64,
    pub persistence_failures: u64,
}
