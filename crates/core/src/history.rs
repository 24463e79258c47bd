//! History store trait: append-only message log per session.
//!
//! Stores are pure storage: no compaction or filtering logic lives here.
//! Appends are atomic per message and reads return the full ordered sequence.

use async_trait::async_trait;

use crate::error::HistoryError;
use crate::message::{Message, SessionId};

/// The core HistoryStore trait.
///
/// Implementations: in-memory (for testing), JSONL file, SQLite.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Append one message to the end of a session's log.
    async fn append(&self, session_id: &SessionId, message: &Message)
    -> std::result::Result<(), HistoryError>;

    /// Read a session's full log in append order. Unknown sessions are empty.
    async fn read(&self, session_id: &SessionId) -> std::result::Result<Vec<Message>, HistoryError>;

    /// Clear a session's log. Idempotent.
    async fn reset(&self, session_id: &SessionId) -> std::result::Result<(), HistoryError>;

    /// Sessions that currently hold at least one message.
    async fn sessions(&self) -> std::result::Result<Vec<SessionId>, HistoryError>;

    /// Number of stored messages for a session.
    async fn len(&self, session_id: &SessionId) -> std::result::Result<usize, HistoryError> {
        Ok(self.read(session_id).await?.len())
    }
}
