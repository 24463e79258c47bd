//! SQLite history backend.
//!
//! A single `messages` table keyed by an autoincrement sequence keeps the
//! append order per session. Each row stores the JSON-encoded `Message`.

use async_trait::async_trait;
use chrono::Utc;
use loopwright_core::error::HistoryError;
use loopwright_core::history::HistoryStore;
use loopwright_core::message::{Message, SessionId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{info, warn};

/// A durable SQLite history store.
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open (or create) a database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, HistoryError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| HistoryError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite history backend initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, HistoryError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                message     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)")
            .execute(&self.pool)
            .await
            .map_err(|e| HistoryError::MigrationFailed(format!("session index: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), HistoryError> {
        let json = serde_json::to_string(message)
            .map_err(|e| HistoryError::Serialization(format!("Failed to serialize message: {e}")))?;

        sqlx::query("INSERT INTO messages (session_id, message, created_at) VALUES (?1, ?2, ?3)")
            .bind(session_id.as_str())
            .bind(json)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| HistoryError::Storage(format!("Insert failed: {e}")))?;
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Message>, HistoryError> {
        let rows = sqlx::query("SELECT seq, message FROM messages WHERE session_id = ?1 ORDER BY seq")
            .bind(session_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let json: String = row.get("message");
            match serde_json::from_str::<Message>(&json) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(session_id = %session_id, seq, error = %e, "Skipping corrupted history row");
                }
            }
        }
        Ok(messages)
    }

    async fn reset(&self, session_id: &SessionId) -> Result<(), HistoryError> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| HistoryError::Storage(format!("Delete failed: {e}")))?;
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, HistoryError> {
        let rows = sqlx::query("SELECT DISTINCT session_id FROM messages ORDER BY session_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| SessionId(row.get::<String, _>("session_id")))
            .collect())
    }

    async fn len(&self, session_id: &SessionId) -> Result<usize, HistoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE session_id = ?1")
            .bind(session_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
        let count: i64 = row.get("cnt");
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
