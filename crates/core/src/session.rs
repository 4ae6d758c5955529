//! Session trait — durable, append-only conversation history.
//!
//! A session is one ongoing conversation owned by one agent. Its history only
//! ever grows: [`SessionStore::update`] receives the caller's complete view
//! and appends whatever suffix has not been recorded yet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::Message;

/// One conversation and its recorded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,

    /// The agent that owns this session
    pub agent_id: String,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every `update`
    pub last_active_at: DateTime<Utc>,

    /// Set for sub-conversations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,

    /// 0 for a top-level session, parent's depth + 1 otherwise
    #[serde(default)]
    pub depth: u32,

    /// Ordered messages (generation order)
    #[serde(default)]
    pub history: Vec<Message>,
}

impl Session {
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// The session persistence contract.
///
/// Every operation is atomic for its own session id. No ordering is implied
/// between operations on different sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Allocate a new, empty session.
    async fn create(
        &self,
        agent_id: &str,
        parent_session_id: Option<&str>,
    ) -> Result<Session, StoreError>;

    /// Metadata plus the full recorded history, in append order.
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Append the part of `history` that is not yet recorded.
    ///
    /// `history` is the caller's complete view of the session. Entries already
    /// stored are identified by count, since they are never edited or removed.
    async fn update(&self, id: &str, history: &[Message]) -> Result<(), StoreError>;

    /// Remove a session and its history. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Sessions owned by `agent_id`, newest created first.
    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Release underlying resources. Further calls may fail with `StoreError::Storage`.
    async fn close(&self) {}
}
