//! Step executor trait: the abstraction over one bounded model call.
//!
//! A step executor takes a formatted conversation and the enabled tool set,
//! performs exactly one model invocation, and reports what happened: text,
//! requested tool calls, why generation stopped, and token usage.
//!
//! Concrete LLM bindings live outside this workspace and implement this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::message::{Message, MessageToolCall, SessionId};

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Input to a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub session_id: SessionId,

    /// 1-based step number within the current run
    pub step: usize,

    /// Provider-ready view of the history, system prompt first
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

/// Why a step (or a run) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Cancelled,
    MaxSteps,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool-calls",
            Self::Length => "length",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::MaxSteps => "max-steps",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }

    /// Accumulate another step's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        fn sum(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.reasoning_tokens = sum(self.reasoning_tokens, other.reasoning_tokens);
        self.cache_read_tokens = sum(self.cache_read_tokens, other.cache_read_tokens);
        self.cache_write_tokens = sum(self.cache_write_tokens, other.cache_write_tokens);
    }
}

/// Output of one bounded model call. Not persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    pub finish_reason: FinishReason,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StepResult {
    /// A plain text completion.
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: Some(usage),
        }
    }

    /// A completion that requests tool calls.
    pub fn tool_calls(calls: Vec<MessageToolCall>, usage: Usage) -> Self {
        Self {
            text: String::new(),
            reasoning: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            usage: Some(usage),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Incremental output produced while a step is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "delta", rename_all = "snake_case")]
pub enum StepChunk {
    Text(String),
    Reasoning(String),
}

/// The core step executor trait.
///
/// Implementations must honor `cancel` promptly and report usage whenever the
/// underlying provider makes it available. Transient failures are retried by
/// the implementation itself, never by the caller.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// A human-readable name (e.g., "anthropic", "scripted").
    fn name(&self) -> &str;

    /// Perform one model call.
    async fn execute(
        &self,
        request: StepRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<StepResult, StepError>;

    /// Perform one model call, forwarding incremental output on `chunks`.
    ///
    /// Default implementation calls `execute()` and forwards the whole text
    /// as a single chunk.
    async fn execute_streaming(
        &self,
        request: StepRequest,
        chunks: mpsc::Sender<StepChunk>,
        cancel: &CancellationToken,
    ) -> std::result::Result<StepResult, StepError> {
        let result = self.execute(request, cancel).await?;
        if let Some(reasoning) = &result.reasoning {
            let _ = chunks.send(StepChunk::Reasoning(reasoning.clone())).await;
        }
        if !result.text.is_empty() {
            let _ = chunks.send(StepChunk::Text(result.text.clone())).await;
        }
        Ok(result)
    }
}
