//! Message queue collaborator.
//!
//! Holds user messages sent while a run is in progress. The formatted view
//! peeks at them; the turn loop drains them when it would otherwise stop.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::message::{Message, SessionId};

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn push(&self, session_id: &SessionId, message: Message);

    /// Queued messages, left in place.
    async fn pending(&self, session_id: &SessionId) -> Vec<Message>;

    /// Remove and return every queued message.
    async fn drain(&self, session_id: &SessionId) -> Vec<Message>;

    async fn clear(&self, session_id: &SessionId);
}

/// Process-local queue keyed by session.
#[derive(Default)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<SessionId, VecDeque<Message>>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn push(&self, session_id: &SessionId, message: Message) {
        self.queues
            .lock()
            .await
            .entry(session_id.clone())
            .or_default()
            .push_back(message);
    }

    async fn pending(&self, session_id: &SessionId) -> Vec<Message> {
        self.queues
            .lock()
            .await
            .get(session_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn drain(&self, session_id: &SessionId) -> Vec<Message> {
        self.queues
            .lock()
            .await
            .remove(session_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    async fn clear(&self, session_id: &SessionId) {
        self.queues.lock().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_peeks_and_drain_empties() {
        let queue = InMemoryMessageQueue::new();
        let s = SessionId::from("s");
        queue.push(&s, Message::user("one")).await;
        queue.push(&s, Message::user("two")).await;

        assert_eq!(queue.pending(&s).await.len(), 2);
        assert_eq!(queue.pending(&s).await.len(), 2);

        let drained = queue.drain(&s).await;
        assert_eq!(drained[0].text(), "one");
        assert_eq!(drained[1].text(), "two");
        assert!(queue.pending(&s).await.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let queue = InMemoryMessageQueue::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        queue.push(&a, Message::user("for a")).await;
        queue.clear(&b).await;
        assert_eq!(queue.pending(&a).await.len(), 1);
        assert!(queue.pending(&b).await.is_empty());
    }
}
