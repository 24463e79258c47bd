//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use loopwright_core::error::{StepError, ToolError};
use loopwright_core::message::{MessageToolCall, SessionId};
use loopwright_core::step::{
    StepChunk, StepExecutor, StepRequest, StepResult, ToolDefinition, Usage,
};
use loopwright_core::tool::ToolExecutor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Returns scripted step results in order and records every request.
///
/// Once the script runs out, calls fail with `InvalidResponse`.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<StepResult, StepError>>>,
    requests: Mutex<Vec<StepRequest>>,
    chunks: Vec<StepChunk>,
    block: bool,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<StepResult, StepError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            chunks: Vec::new(),
            block: false,
        }
    }

    /// Stream these chunks instead of the whole text.
    pub fn with_chunks(mut self, chunks: Vec<StepChunk>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Every call waits for cancellation.
    pub fn blocking(mut self) -> Self {
        self.block = true;
        self
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        request: StepRequest,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        self.requests.lock().unwrap().push(request);
        if self.block {
            cancel.cancelled().await;
            return Err(StepError::Cancelled);
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(StepError::InvalidResponse("script exhausted".into())))
    }

    async fn execute_streaming(
        &self,
        request: StepRequest,
        chunks: mpsc::Sender<StepChunk>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let result = self.execute(request, cancel).await?;
        if self.chunks.is_empty() {
            if !result.text.is_empty() {
                let _ = chunks.send(StepChunk::Text(result.text.clone())).await;
            }
        } else {
            for chunk in &self.chunks {
                let _ = chunks.send(chunk.clone()).await;
            }
        }
        Ok(result)
    }
}

pub fn text_step(text: &str) -> StepResult {
    StepResult::text(text, Usage::new(10, 5))
}

pub fn tool_step(calls: Vec<MessageToolCall>) -> StepResult {
    StepResult::tool_calls(calls, Usage::new(10, 5))
}

pub fn call(id: &str, name: &str, arguments: &str) -> MessageToolCall {
    MessageToolCall::new(id, name, arguments)
}

/// Echoes arguments back. `fail` errors, `slow` takes a minute.
#[derive(Default)]
pub struct RecordingTools {
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingTools {
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo the arguments".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]
    }

    async fn execute_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        _session_id: &SessionId,
    ) -> Result<serde_json::Value, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        match name {
            "fail" => Err(ToolError::ExecutionFailed {
                tool_name: name.into(),
                reason: "boom".into(),
            }),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::Value::Null)
            }
            _ => Ok(arguments),
        }
    }
}
