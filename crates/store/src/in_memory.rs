//! In-memory session store — useful for testing and ephemeral runs.

use aegis_core::error::StoreError;
use aegis_core::message::Message;
use aegis_core::session::{Session, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Keeps sessions in a map. Nothing survives the process.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
    next_seq: AtomicU64,
}

struct StoredSession {
    session: Session,
    /// Insertion counter so sessions created within the same instant still sort.
    seq: u64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create(
        &self,
        agent_id: &str,
        parent_session_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;

        let depth = match parent_session_id {
            Some(parent) => {
                let parent = sessions
                    .get(parent)
                    .ok_or_else(|| StoreError::NotFound(parent.to_string()))?;
                parent.session.depth + 1
            }
            None => 0,
        };

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            created_at: now,
            last_active_at: now,
            parent_session_id: parent_session_id.map(str::to_string),
            depth,
            history: Vec::new(),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            session.id.clone(),
            StoredSession {
                session: session.clone(),
                seq,
            },
        );
        debug!(session_id = %session.id, agent_id, depth, "Created session");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).map(|s| s.session.clone()))
    }

    async fn update(&self, id: &str, history: &[Message]) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let recorded = stored.session.history.len();
        if history.len() > recorded {
            stored
                .session
                .history
                .extend_from_slice(&history[recorded..]);
        }
        stored.session.last_active_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut owned: Vec<&StoredSession> = sessions
            .values()
            .filter(|s| s.session.agent_id == agent_id)
            .collect();
        owned.sort_by(|a, b| {
            b.session
                .created_at
                .cmp(&a.session.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(owned.into_iter().map(|s| s.session.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemorySessionStore::new();
        let session = store.create("agent-1", None).await.unwrap();
        assert_eq!(session.depth, 0);
        assert!(session.history.is_empty());

        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn child_session_depth() {
        let store = InMemorySessionStore::new();
        let root = store.create("a", None).await.unwrap();
        let child = store.create("a", Some(&root.id)).await.unwrap();
        let grandchild = store.create("a", Some(&child.id)).await.unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.parent_session_id.as_deref(), Some(child.id.as_str()));
    }

    #[tokio::test]
    async fn unknown_parent_is_rejected() {
        let store = InMemorySessionStore::new();
        let err = store.create("a", Some("missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_appends_only_the_new_suffix() {
        let store = InMemorySessionStore::new();
        let session = store.create("a", None).await.unwrap();

        let a = Message::user("A");
        let b = Message::assistant("B");
        store.update(&session.id, &[a.clone()]).await.unwrap();
        store.update(&session.id, &[a.clone()]).await.unwrap();
        store.update(&session.id, &[a.clone(), b.clone()]).await.unwrap();

        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.history, vec![a, b]);
        assert!(fetched.last_active_at >= session.last_active_at);
    }

    #[tokio::test]
    async fn update_unknown_session_fails() {
        let store = InMemorySessionStore::new();
        let err = store.update("nope", &[Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_newest_first_and_delete() {
        let store = InMemorySessionStore::new();
        let first = store.create("a", None).await.unwrap();
        let second = store.create("a", None).await.unwrap();
        store.create("b", None).await.unwrap();

        let listed = store.list_by_agent("a").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

        assert!(store.delete(&first.id).await.unwrap());
        assert!(!store.delete(&first.id).await.unwrap());
        assert_eq!(store.list_by_agent("a").await.unwrap().len(), 1);
    }
}
