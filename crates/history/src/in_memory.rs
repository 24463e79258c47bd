//! In-memory backend: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use loopwright_core::error::HistoryError;
use loopwright_core::history::HistoryStore;
use loopwright_core::message::{Message, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An in-memory store that keeps each session's log in a Vec.
/// Useful for testing and sessions where persistence isn't needed.
pub struct InMemoryHistory {
    sessions: Arc<RwLock<HashMap<SessionId, Vec<Message>>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), HistoryError> {
        self.sessions
            .write()
            .await
            .entry(session_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Message>, HistoryError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset(&self, session_id: &SessionId) -> Result<(), HistoryError> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, HistoryError> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn len(&self, session_id: &SessionId) -> Result<usize, HistoryError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len))
    }
}
