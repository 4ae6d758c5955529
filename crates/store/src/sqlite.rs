//! SQLite session store.
//!
//! Uses a single SQLite database file (WAL journal) with two tables:
//! - `sessions` — one row per conversation (owner, lineage, timestamps)
//! - `session_messages` — the append-only message ledger, keyed by
//!   `(session_id, seq)`
//!
//! History is rebuilt by reading the ledger in `seq` order, so a session read
//! after any number of restarts returns exactly the messages accepted by
//! earlier `update` calls.

use aegis_core::error::StoreError;
use aegis_core::message::{Message, Role};
use aegis_core::session::{Session, SessionStore};
use aegis_core::tool::ToolCall;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A durable session store backed by SQLite.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    /// Serialises `update` per session; different sessions never contend.
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SqliteSessionStore {
    /// Open (or create) a store at `path`.
    ///
    /// The database and all tables/indexes are created automatically.
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let in_memory = path.contains(":memory:");
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite session store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            session_locks: Mutex::new(HashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run schema migrations — creates tables and indexes.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id                TEXT PRIMARY KEY NOT NULL,
                agent_id          TEXT NOT NULL,
                parent_session_id TEXT,
                depth             INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT NOT NULL,
                last_active_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_messages (
                session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                seq          INTEGER NOT NULL,
                role         TEXT NOT NULL,
                content      TEXT NOT NULL,
                tool_call_id TEXT,
                tool_calls   TEXT NOT NULL DEFAULT '[]',
                timestamp    TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("session_messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("agent index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Fixed-width RFC 3339 with nanoseconds: lossless and lexicographically ordered.
    fn encode_time(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn decode_time(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("{column} '{raw}': {e}")))
    }

    fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
    where
        T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        row.try_get(name)
            .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
    }

    /// Parse a `Message` from a `session_messages` row.
    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
        let role: String = Self::column(row, "role")?;
        let role = Role::from_str(&role).map_err(StoreError::Corrupt)?;
        let tool_calls: String = Self::column(row, "tool_calls")?;
        let tool_calls: Vec<ToolCall> = serde_json::from_str(&tool_calls)
            .map_err(|e| StoreError::Corrupt(format!("tool_calls: {e}")))?;
        let timestamp: String = Self::column(row, "timestamp")?;

        Ok(Message {
            role,
            content: Self::column(row, "content")?,
            timestamp: Self::decode_time("timestamp", &timestamp)?,
            tool_call_id: Self::column(row, "tool_call_id")?,
            tool_calls,
        })
    }

    /// Parse a `Session` (without history) from a `sessions` row.
    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, StoreError> {
        let depth: i64 = Self::column(row, "depth")?;
        let created_at: String = Self::column(row, "created_at")?;
        let last_active_at: String = Self::column(row, "last_active_at")?;

        Ok(Session {
            id: Self::column(row, "id")?,
            agent_id: Self::column(row, "agent_id")?,
            created_at: Self::decode_time("created_at", &created_at)?,
            last_active_at: Self::decode_time("last_active_at", &last_active_at)?,
            parent_session_id: Self::column(row, "parent_session_id")?,
            depth: u32::try_from(depth)
                .map_err(|_| StoreError::Corrupt(format!("depth {depth} out of range")))?,
            history: Vec::new(),
        })
    }

    async fn load_history(
        conn: &mut SqliteConnection,
        session_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT role, content, tool_call_id, tool_calls, timestamp
             FROM session_messages WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("history of {session_id}: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create(
        &self,
        agent_id: &str,
        parent_session_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let depth = match parent_session_id {
            Some(parent) => {
                let row = sqlx::query("SELECT depth FROM sessions WHERE id = ?1")
                    .bind(parent)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::QueryFailed(format!("parent lookup: {e}")))?
                    .ok_or_else(|| StoreError::NotFound(parent.to_string()))?;
                let parent_depth: i64 = Self::column(&row, "depth")?;
                u32::try_from(parent_depth + 1)
                    .map_err(|_| StoreError::Corrupt(format!("depth {parent_depth} out of range")))?
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

        sqlx::query(
            r#"
            INSERT INTO sessions (id, agent_id, parent_session_id, depth, created_at, last_active_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&session.id)
        .bind(&session.agent_id)
        .bind(&session.parent_session_id)
        .bind(i64::from(session.depth))
        .bind(Self::encode_time(&session.created_at))
        .bind(Self::encode_time(&session.last_active_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT session failed: {e}")))?;

        debug!(session_id = %session.id, agent_id, depth, "Created session");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        // One read transaction so metadata and ledger come from the same snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET session: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut session = Self::row_to_session(&row)?;
        session.history = Self::load_history(&mut tx, id).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;
        Ok(Some(session))
    }

    async fn update(&self, id: &str, history: &[Message]) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let row = sqlx::query(
            r#"
            SELECT
                EXISTS(SELECT 1 FROM sessions WHERE id = ?1) AS present,
                (SELECT COUNT(*) FROM session_messages WHERE session_id = ?1) AS recorded
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("ledger count: {e}")))?;

        let present: i64 = Self::column(&row, "present")?;
        if present == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let recorded: i64 = Self::column(&row, "recorded")?;
        let recorded = usize::try_from(recorded)
            .map_err(|_| StoreError::Corrupt(format!("ledger count {recorded}")))?;

        let pending = history.get(recorded..).unwrap_or_default();
        for (offset, message) in pending.iter().enumerate() {
            let tool_calls = serde_json::to_string(&message.tool_calls)
                .map_err(|e| StoreError::Storage(format!("tool_calls serialization: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO session_messages
                    (session_id, seq, role, content, tool_call_id, tool_calls, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(id)
            .bind((recorded + offset) as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&message.tool_call_id)
            .bind(tool_calls)
            .bind(Self::encode_time(&message.timestamp))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("INSERT message failed: {e}")))?;
        }

        sqlx::query("UPDATE sessions SET last_active_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Self::encode_time(&Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE last_active_at failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        if !pending.is_empty() {
            debug!(session_id = id, appended = pending.len(), total = history.len(), "Appended session messages");
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        sqlx::query("DELETE FROM session_messages WHERE session_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE messages failed: {e}")))?;

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE session failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        self.session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Session>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )
        .bind(agent_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list sessions: {e}")))?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut session = Self::row_to_session(row)?;
            session.history = Self::load_history(&mut tx, &session.id).await?;
            sessions.push(session);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;
        Ok(sessions)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("SQLite session store closed");
    }
}
