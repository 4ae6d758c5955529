//! Offline provider for local smoke runs: no network, no API key.

use aegis_core::error::ProviderError;
use aegis_core::message::{Message, Role};
use aegis_core::provider::{Generation, Provider};
use async_trait::async_trait;

/// Repeats the latest user message, numbered by its position in the conversation.
///
/// Because it counts every user message it is shown, a resumed session
/// visibly continues where it left off.
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, history: &[Message]) -> Result<Generation, ProviderError> {
        let mut user_messages = history.iter().filter(|m| m.role == Role::User);
        let count = user_messages.clone().count();
        let last = user_messages
            .next_back()
            .ok_or_else(|| ProviderError::InvalidResponse("no user message to echo".into()))?;
        Ok(Generation::text(format!("[{count}] You said: {}", last.content)))
    }
}
