//! Provider trait — the abstraction over model backends.
//!
//! A Provider turns a message history into a [`Generation`]: some text, some
//! requested tool calls, or both. How it reaches its backend (HTTP, local
//! inference, a script in a test) is its own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::ToolCall;

/// The result of one generation round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    /// Generated text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Tool calls requested by the model, in the order they should run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Generation {
    /// A text-only generation (the model is done).
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    /// A generation that only requests tool calls.
    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// The core Provider trait.
///
/// Every model backend implements this trait. The agent loop calls
/// `generate()` without knowing which backend is being used.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "anthropic").
    fn name(&self) -> &str;

    /// Generate a response for the full message history.
    async fn generate(&self, history: &[Message]) -> Result<Generation, ProviderError>;
}
