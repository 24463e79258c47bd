//! Run events: what a turn loop reports while it works.
//!
//! Every run emits `llm:thinking` first and `run:complete` last. Events are
//! delivered to the caller on an ordered channel and mirrored onto a
//! broadcast [`EventBus`] so other components can observe every session
//! without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::approval::{ApprovalRequest, ApprovalResponse};
use crate::message::{SessionId, ToolOutcome};
use crate::step::{FinishReason, StepChunk, Usage};

/// All events a run can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    /// A step is about to call the model
    #[serde(rename = "llm:thinking")]
    Thinking { step: usize },

    /// Incremental text or reasoning
    #[serde(rename = "llm:chunk")]
    Chunk { step: usize, chunk: StepChunk },

    /// Final text and usage of one step
    #[serde(rename = "llm:response")]
    Response {
        step: usize,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    #[serde(rename = "llm:tool-call")]
    ToolCall {
        step: usize,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "llm:tool-result")]
    ToolResult {
        step: usize,
        tool_call_id: String,
        tool_name: String,
        outcome: ToolOutcome,
        output: String,
    },

    #[serde(rename = "approval:request")]
    ApprovalRequest { request: ApprovalRequest },

    #[serde(rename = "approval:response")]
    ApprovalResponse { response: ApprovalResponse },

    #[serde(rename = "context:compacted")]
    ContextCompacted {
        strategy: String,
        before_tokens: usize,
        after_tokens: usize,
        before_messages: usize,
        after_messages: usize,
    },

    #[serde(rename = "llm:error")]
    Error {
        message: String,
        recoverable: bool,
        /// A calling layer may retry the whole run
        retryable: bool,
    },

    /// Always the final event of a run
    #[serde(rename = "run:complete")]
    RunComplete {
        finish_reason: FinishReason,
        steps: usize,
        usage: Usage,
    },
}

impl RunEvent {
    /// Wire name of the event (e.g. `llm:tool-call`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "llm:thinking",
            Self::Chunk { .. } => "llm:chunk",
            Self::Response { .. } => "llm:response",
            Self::ToolCall { .. } => "llm:tool-call",
            Self::ToolResult { .. } => "llm:tool-result",
            Self::ApprovalRequest { .. } => "approval:request",
            Self::ApprovalResponse { .. } => "approval:response",
            Self::ContextCompacted { .. } => "context:compacted",
            Self::Error { .. } => "llm:error",
            Self::RunComplete { .. } => "run:complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunComplete { .. })
    }
}

/// A run event tagged with its session, as published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub event: RunEvent,
    pub timestamp: DateTime<Utc>,
}

/// A broadcast-based event bus for run events across sessions.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Subscribers filter by session for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<SessionEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, session_id: &SessionId, event: RunEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(SessionEvent {
            session_id: session_id.clone(),
            event,
            timestamp: Utc::now(),
        }));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(&SessionId::from("s1"), RunEvent::Thinking { step: 1 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id.as_str(), "s1");
        match &event.event {
            RunEvent::Thinking { step } => assert_eq!(*step, 1),
            other => panic!("Expected Thinking event, got {other:?}"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(
            &SessionId::from("s1"),
            RunEvent::Error {
                message: "no subscribers".into(),
                recoverable: false,
                retryable: false,
            },
        );
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let event = RunEvent::RunComplete {
            finish_reason: FinishReason::MaxSteps,
            steps: 3,
            usage: Usage::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run:complete");
        assert_eq!(json["finish_reason"], "max-steps");
        assert_eq!(event.name(), "run:complete");
        assert!(event.is_terminal());

        let chunk = RunEvent::Chunk {
            step: 1,
            chunk: StepChunk::Text("he".into()),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "llm:chunk");
        assert_eq!(json["chunk"]["delta"], "he");
    }
}
