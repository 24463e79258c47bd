//! The turn executor: a bounded step loop against the model.
//!
//! ```text
//! idle → running → (tool-pending → running)* → stop | max-steps | error | cancelled
//! ```
//!
//! Per step the executor formats the session view, calls the step executor,
//! and on `tool-calls` persists the assistant message, resolves approval for
//! each call, runs the approved ones and persists every result (denials and
//! failures included). Overflow triggers compaction after the step. A user
//! message queued while the loop ran is injected instead of being dropped.

use std::sync::Arc;

use loopwright_approval::{ApprovalGate, ApprovalTicket};
use loopwright_config::CompactionConfig;
use loopwright_core::approval::{ApprovalDetails, DenialReason};
use loopwright_core::error::{Result, StepError};
use loopwright_core::event::RunEvent;
use loopwright_core::message::{MessageToolCall, ToolOutcome};
use loopwright_core::step::{FinishReason, StepExecutor, StepRequest, StepResult, Usage};
use loopwright_core::tool::ToolExecutor;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compaction::{CompactionStrategy, ReactiveSummaryStrategy};
use crate::context::ContextManager;
use crate::stream_event::RunEventSink;

/// Buffer between a streaming step executor and the event sink.
const CHUNK_BUFFER: usize = 64;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub finish_reason: FinishReason,
    /// Model calls made
    pub steps: usize,
    /// Text of the final assistant response
    pub text: String,
    /// Usage summed over every step
    pub usage: Usage,
}

#[derive(Default)]
struct RunState {
    steps: usize,
    usage: Usage,
    text: String,
}

/// Whether a batch of tool calls ran to the end or was cut short.
enum ToolBatch {
    Completed,
    Cancelled,
}

pub struct TurnExecutor {
    step_executor: Arc<dyn StepExecutor>,
    tools: Arc<dyn ToolExecutor>,
    gate: Arc<ApprovalGate>,
    strategy: Arc<dyn CompactionStrategy>,
    max_steps: usize,
}

impl TurnExecutor {
    /// Summarizes with the same step executor on overflow by default.
    pub fn new(
        step_executor: Arc<dyn StepExecutor>,
        tools: Arc<dyn ToolExecutor>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        let strategy = ReactiveSummaryStrategy::new(CompactionConfig::default())
            .with_summarizer(step_executor.clone());
        Self {
            step_executor,
            tools,
            gate,
            strategy: Arc::new(strategy),
            max_steps: 25,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn CompactionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Drive the loop until a terminal state. `run:complete` is always the
    /// last event, on success and on error.
    pub async fn execute(
        &self,
        ctx: &mut ContextManager,
        events: &RunEventSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut state = RunState::default();
        ctx.set_tool_definitions(&self.tools.definitions());
        info!(
            session_id = %ctx.session_id(),
            executor = self.step_executor.name(),
            max_steps = self.max_steps,
            "Run started"
        );

        match self.drive(ctx, events, cancel, &mut state).await {
            Ok(finish_reason) => {
                events.emit(RunEvent::RunComplete {
                    finish_reason,
                    steps: state.steps,
                    usage: state.usage,
                });
                info!(
                    session_id = %ctx.session_id(),
                    %finish_reason,
                    steps = state.steps,
                    total_tokens = state.usage.total_tokens,
                    "Run finished"
                );
                Ok(RunOutcome {
                    finish_reason,
                    steps: state.steps,
                    text: state.text,
                    usage: state.usage,
                })
            }
            Err(e) => {
                warn!(session_id = %ctx.session_id(), error = %e, steps = state.steps, "Run failed");
                events.emit(RunEvent::Error {
                    message: e.user_message(),
                    recoverable: false,
                    retryable: e.is_retryable(),
                });
                ctx.queue().clear(ctx.session_id()).await;
                events.emit(RunEvent::RunComplete {
                    finish_reason: FinishReason::Error,
                    steps: state.steps,
                    usage: state.usage,
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &mut ContextManager,
        events: &RunEventSink,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<FinishReason> {
        loop {
            if cancel.is_cancelled() {
                self.absorb_queue(ctx).await?;
                return Ok(FinishReason::Cancelled);
            }
            if state.steps >= self.max_steps {
                self.absorb_queue(ctx).await?;
                return Ok(FinishReason::MaxSteps);
            }

            state.steps += 1;
            let step = state.steps;
            events.emit(RunEvent::Thinking { step });

            let request = StepRequest {
                session_id: ctx.session_id().clone(),
                step,
                messages: ctx.get_formatted_messages().await?,
                tools: self.tools.definitions(),
            };
            debug!(session_id = %ctx.session_id(), step, messages = request.messages.len(), "Calling model");

            let result = match self.call_model(request, step, events, cancel).await {
                Ok(result) => result,
                Err(StepError::Cancelled) => {
                    debug!(session_id = %ctx.session_id(), step, "Model call cancelled");
                    self.absorb_queue(ctx).await?;
                    return Ok(FinishReason::Cancelled);
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(usage) = &result.usage {
                ctx.record_actual_usage(usage.input_tokens);
                state.usage.add(usage);
            }
            events.emit(RunEvent::Response {
                step,
                text: result.text.clone(),
                reasoning: result.reasoning.clone(),
                finish_reason: result.finish_reason,
                usage: result.usage,
            });

            if result.finish_reason == FinishReason::ToolCalls && result.has_tool_calls() {
                ctx.add_assistant_message(
                    result.text.clone(),
                    result.tool_calls.clone(),
                    result.reasoning.clone(),
                )
                .await?;
                state.text = result.text;

                let batch = self
                    .run_tool_calls(ctx, &result.tool_calls, step, events, cancel)
                    .await?;
                if let ToolBatch::Cancelled = batch {
                    self.absorb_queue(ctx).await?;
                    return Ok(FinishReason::Cancelled);
                }
                self.compact_if_needed(ctx, events, cancel).await;
                continue;
            }

            let StepResult {
                text,
                reasoning,
                finish_reason,
                ..
            } = result;
            if !text.is_empty() || reasoning.is_some() {
                ctx.add_assistant_message(text.clone(), Vec::new(), reasoning)
                    .await?;
            }
            state.text = text;
            self.compact_if_needed(ctx, events, cancel).await;

            let queued = ctx.queue().drain(ctx.session_id()).await;
            if queued.is_empty() {
                // A tool-calls finish without calls has nothing left to do.
                return Ok(match finish_reason {
                    FinishReason::ToolCalls => FinishReason::Stop,
                    other => other,
                });
            }
            debug!(session_id = %ctx.session_id(), count = queued.len(), "Continuing with queued messages");
            for message in &queued {
                ctx.append_message(message).await?;
            }
        }
    }

    /// Call the model, forwarding streamed chunks as they arrive.
    async fn call_model(
        &self,
        request: StepRequest,
        step: usize,
        events: &RunEventSink,
        cancel: &CancellationToken,
    ) -> std::result::Result<StepResult, StepError> {
        let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
        let call = self.step_executor.execute_streaming(request, tx, cancel);
        tokio::pin!(call);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                Some(chunk) = rx.recv() => events.emit(RunEvent::Chunk { step, chunk }),
                result = &mut call => break result,
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            events.emit(RunEvent::Chunk { step, chunk });
        }
        result
    }

    /// Resolve, run and persist each call in request order.
    async fn run_tool_calls(
        &self,
        ctx: &ContextManager,
        calls: &[MessageToolCall],
        step: usize,
        events: &RunEventSink,
        cancel: &CancellationToken,
    ) -> Result<ToolBatch> {
        for (index, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                self.persist_cancelled(ctx, &calls[index..], step, events).await?;
                return Ok(ToolBatch::Cancelled);
            }

            let parsed = call.parsed_arguments();
            events.emit(RunEvent::ToolCall {
                step,
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: parsed
                    .as_ref()
                    .map(Clone::clone)
                    .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone())),
            });
            let arguments = match parsed {
                Ok(arguments) => arguments,
                Err(e) => {
                    let output = format!("Error: invalid tool arguments: {e}");
                    self.persist_result(ctx, call, step, events, output.into(), ToolOutcome::Error)
                        .await?;
                    continue;
                }
            };

            if !self.gate.policy().is_auto_approved(&call.name) {
                let details = ApprovalDetails::ToolConfirmation {
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    arguments: arguments.clone(),
                };
                let ticket = match self.gate.begin(details, Some(ctx.session_id())) {
                    Ok(ticket) => ticket,
                    Err(e) => {
                        // Fatal, but the calls still get results first.
                        for unrun in &calls[index..] {
                            let output = format!("Error: {e}");
                            self.persist_result(ctx, unrun, step, events, output.into(), ToolOutcome::Error)
                                .await?;
                        }
                        return Err(e.into());
                    }
                };
                events.emit(RunEvent::ApprovalRequest {
                    request: ticket.request().clone(),
                });
                let response = match ticket {
                    ApprovalTicket::Resolved { response, .. } => response,
                    ApprovalTicket::Pending(pending) => self.gate.wait(pending, cancel).await,
                };
                events.emit(RunEvent::ApprovalResponse {
                    response: response.clone(),
                });

                if let Some(reason) = response.denial_reason() {
                    debug!(session_id = %ctx.session_id(), tool = %call.name, %reason, "Tool call not approved");
                    let outcome = if reason.is_cancellation() {
                        ToolOutcome::Cancelled
                    } else {
                        ToolOutcome::Denied { reason }
                    };
                    let output = reason.tool_output(&call.name);
                    self.persist_result(ctx, call, step, events, output.into(), outcome)
                        .await?;
                    if cancel.is_cancelled() {
                        self.persist_cancelled(ctx, &calls[index + 1..], step, events)
                            .await?;
                        return Ok(ToolBatch::Cancelled);
                    }
                    continue;
                }
            }

            debug!(session_id = %ctx.session_id(), tool = %call.name, "Executing tool");
            let executed = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.tools.execute_tool(&call.name, arguments, ctx.session_id()) => Some(result),
            };
            match executed {
                None => {
                    self.persist_cancelled(ctx, &calls[index..], step, events).await?;
                    return Ok(ToolBatch::Cancelled);
                }
                Some(Ok(output)) => {
                    self.persist_result(ctx, call, step, events, output, ToolOutcome::Success)
                        .await?;
                }
                Some(Err(e)) => {
                    warn!(session_id = %ctx.session_id(), tool = %call.name, error = %e, "Tool execution failed");
                    let output = format!("Error: {e}");
                    self.persist_result(ctx, call, step, events, output.into(), ToolOutcome::Error)
                        .await?;
                }
            }
        }
        Ok(ToolBatch::Completed)
    }

    async fn persist_result(
        &self,
        ctx: &ContextManager,
        call: &MessageToolCall,
        step: usize,
        events: &RunEventSink,
        raw: serde_json::Value,
        outcome: ToolOutcome,
    ) -> Result<()> {
        let message = ctx
            .add_tool_result(&call.id, &call.name, &raw, outcome.clone())
            .await?;
        events.emit(RunEvent::ToolResult {
            step,
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome,
            output: message.text(),
        });
        Ok(())
    }

    /// Every call that will not run still gets a result so history stays
    /// self-consistent.
    async fn persist_cancelled(
        &self,
        ctx: &ContextManager,
        calls: &[MessageToolCall],
        step: usize,
        events: &RunEventSink,
    ) -> Result<()> {
        for call in calls {
            let output = DenialReason::UserCancelled.tool_output(&call.name);
            self.persist_result(ctx, call, step, events, output.into(), ToolOutcome::Cancelled)
                .await?;
        }
        Ok(())
    }

    /// Persist follow-ups that arrived too late to be answered this run.
    async fn absorb_queue(&self, ctx: &ContextManager) -> Result<()> {
        for message in ctx.queue().drain(ctx.session_id()).await {
            ctx.append_message(&message).await?;
        }
        Ok(())
    }

    /// Compaction never fails a run.
    async fn compact_if_needed(
        &self,
        ctx: &mut ContextManager,
        events: &RunEventSink,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        match ctx.maybe_compact(self.strategy.as_ref(), cancel).await {
            Ok(Some(report)) => events.emit(RunEvent::ContextCompacted {
                strategy: report.strategy,
                before_tokens: report.before_tokens,
                after_tokens: report.after_tokens,
                before_messages: report.before_messages,
                after_messages: report.after_messages,
            }),
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %ctx.session_id(), strategy = self.strategy.name(), error = %e, "Compaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::NoopStrategy;
    use crate::test_helpers::{RecordingTools, ScriptedExecutor, call, text_step, tool_step};
    use loopwright_approval::ApprovalPolicy;
    use loopwright_config::ApprovalMode;
    use loopwright_core::approval::ApprovalResponse;
    use loopwright_core::error::Error;
    use loopwright_core::message::{Message, Role, SessionId};
    use loopwright_core::step::StepChunk;
    use loopwright_history::InMemoryHistory;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn gate(mode: ApprovalMode) -> Arc<ApprovalGate> {
        Arc::new(ApprovalGate::new(ApprovalPolicy::new(mode)))
    }

    fn context() -> ContextManager {
        ContextManager::new(SessionId::from("s"), Arc::new(InMemoryHistory::new()))
    }

    fn drain(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn names(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(RunEvent::name).collect()
    }

    fn executor(
        script: Vec<std::result::Result<StepResult, StepError>>,
        tools: Arc<RecordingTools>,
        gate: Arc<ApprovalGate>,
    ) -> TurnExecutor {
        TurnExecutor::new(Arc::new(ScriptedExecutor::new(script)), tools, gate)
            .with_strategy(Arc::new(NoopStrategy))
    }

    #[tokio::test]
    async fn simple_turn_stops_after_one_step() {
        let mut ctx = context();
        ctx.add_user_message("hi").await.unwrap();
        let (sink, mut rx) = RunEventSink::channel(ctx.session_id().clone());
        let turn = executor(
            vec![Ok(text_step("hello"))],
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::Manual),
        );

        let outcome = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.usage.total_tokens, 15);

        let history = ctx.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);

        let events = drain(&mut rx);
        assert_eq!(
            names(&events),
            vec!["llm:thinking", "llm:chunk", "llm:response", "run:complete"]
        );
    }

    #[tokio::test]
    async fn tool_loop_is_bounded_by_max_steps() {
        let mut ctx = context();
        ctx.add_user_message("loop forever").await.unwrap();
        let script = (0..5)
            .map(|i| Ok(tool_step(vec![call(&format!("c{i}"), "echo", "{}")])))
            .collect();
        let tools = Arc::new(RecordingTools::default());
        let turn = executor(script, tools.clone(), gate(ApprovalMode::AutoApprove)).with_max_steps(3);

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::MaxSteps);
        assert_eq!(outcome.steps, 3);
        assert_eq!(tools.calls().len(), 3);

        let history = ctx.history().await.unwrap();
        let with_calls = history.iter().filter(|m| !m.tool_calls.is_empty()).count();
        let results = history.iter().filter(|m| m.role == Role::Tool).count();
        assert_eq!((with_calls, results), (3, 3));
    }

    #[tokio::test]
    async fn denied_tool_is_persisted_and_loop_continues() {
        let mut ctx = context();
        ctx.add_user_message("delete everything").await.unwrap();
        let tools = Arc::new(RecordingTools::default());
        let turn = executor(
            vec![
                Ok(tool_step(vec![call("c1", "shell", r#"{"cmd":"rm -rf /"}"#)])),
                Ok(text_step("ok, I won't")),
            ],
            tools.clone(),
            gate(ApprovalMode::AutoDeny),
        );
        let (sink, mut rx) = RunEventSink::channel(ctx.session_id().clone());

        let outcome = turn.execute(&mut ctx, &sink, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert!(tools.calls().is_empty());

        let history = ctx.history().await.unwrap();
        let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(result.text().starts_with("[Denied]"));
        assert_eq!(
            result.metadata.tool_outcome,
            Some(ToolOutcome::Denied {
                reason: DenialReason::SystemDenied
            })
        );

        let events = drain(&mut rx);
        let names = names(&events);
        let request = names.iter().position(|n| *n == "approval:request").unwrap();
        assert_eq!(names[request + 1], "approval:response");
        assert_eq!(*names.last().unwrap(), "run:complete");
    }

    #[tokio::test]
    async fn auto_approved_tools_skip_the_gate() {
        let mut ctx = context();
        ctx.add_user_message("read it").await.unwrap();
        let gate = Arc::new(ApprovalGate::new(
            ApprovalPolicy::new(ApprovalMode::Manual).with_auto_approve(vec!["read_*".into()]),
        ));
        let tools = Arc::new(RecordingTools::default());
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "read_file", "{}")])), Ok(text_step("done"))],
            tools.clone(),
            gate.clone(),
        );
        let (sink, mut rx) = RunEventSink::channel(ctx.session_id().clone());

        turn.execute(&mut ctx, &sink, &CancellationToken::new()).await.unwrap();
        assert_eq!(tools.calls().len(), 1);
        assert!(!names(&drain(&mut rx)).contains(&"approval:request"));
        assert_eq!(gate.audit().count(), 0);
    }

    #[tokio::test]
    async fn manual_approval_waits_for_response() {
        let mut ctx = context();
        ctx.add_user_message("run it").await.unwrap();
        let gate = gate(ApprovalMode::Manual);
        let tools = Arc::new(RecordingTools::default());
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "shell", "{}")])), Ok(text_step("ran"))],
            tools.clone(),
            gate.clone(),
        );

        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(request) = gate.pending_requests().first() {
                        gate.respond(ApprovalResponse::approved(&request.approval_id)).unwrap();
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(outcome.text, "ran");
        assert_eq!(tools.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn approval_timeout_is_a_denial_not_a_hang() {
        let mut ctx = context();
        ctx.add_user_message("run it").await.unwrap();
        let gate = Arc::new(ApprovalGate::new(
            ApprovalPolicy::new(ApprovalMode::Manual).with_timeout(Duration::from_secs(2)),
        ));
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "shell", "{}")])), Ok(text_step("no answer"))],
            Arc::new(RecordingTools::default()),
            gate,
        );

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        let history = ctx.history().await.unwrap();
        let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(
            result.metadata.tool_outcome,
            Some(ToolOutcome::Denied {
                reason: DenialReason::Timeout
            })
        );
    }

    #[tokio::test]
    async fn tool_failures_become_content() {
        let mut ctx = context();
        ctx.add_user_message("try").await.unwrap();
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "fail", "{}")])), Ok(text_step("it failed"))],
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::AutoApprove),
        );

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        let history = ctx.history().await.unwrap();
        let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(result.text().starts_with("Error:"));
        assert_eq!(result.metadata.tool_outcome, Some(ToolOutcome::Error));
    }

    #[tokio::test]
    async fn malformed_arguments_are_reported_to_the_model() {
        let mut ctx = context();
        ctx.add_user_message("try").await.unwrap();
        let tools = Arc::new(RecordingTools::default());
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "echo", "{not json")])), Ok(text_step("oops"))],
            tools.clone(),
            gate(ApprovalMode::AutoApprove),
        );

        let sink = RunEventSink::new(ctx.session_id().clone());
        turn.execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert!(tools.calls().is_empty());
        let history = ctx.history().await.unwrap();
        let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(result.text().contains("invalid tool arguments"));
    }

    #[tokio::test]
    async fn provider_error_is_fatal_and_clears_queue() {
        let mut ctx = context();
        ctx.add_user_message("hi").await.unwrap();
        ctx.queue().push(ctx.session_id(), Message::user("follow-up")).await;
        let turn = executor(
            vec![Err(StepError::RateLimited { retry_after_secs: 7 })],
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::Manual),
        );
        let (sink, mut rx) = RunEventSink::channel(ctx.session_id().clone());

        let err = turn.execute(&mut ctx, &sink, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(ctx.queue().pending(ctx.session_id()).await.is_empty());

        let events = drain(&mut rx);
        match &events[events.len() - 2] {
            RunEvent::Error { recoverable, retryable, .. } => {
                assert!(!recoverable);
                assert!(retryable);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunComplete { finish_reason: FinishReason::Error, .. })
        ));
    }

    #[tokio::test]
    async fn headless_gate_fails_the_run() {
        let mut ctx = context();
        ctx.add_user_message("hi").await.unwrap();
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "shell", "{}")]))],
            Arc::new(RecordingTools::default()),
            Arc::new(ApprovalGate::headless(ApprovalPolicy::new(ApprovalMode::Manual))),
        );
        let sink = RunEventSink::new(ctx.session_id().clone());
        let err = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Approval(_)));
        let history = ctx.history().await.unwrap();
        assert_eq!(history.last().map(|m| m.role), Some(Role::Tool));
    }

    #[tokio::test]
    async fn cancellation_during_model_call_ends_cancelled() {
        let mut ctx = context();
        ctx.add_user_message("hi").await.unwrap();
        let executor = Arc::new(ScriptedExecutor::new(vec![]).blocking());
        let turn = TurnExecutor::new(
            executor,
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::Manual),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Cancelled);
        assert_eq!(ctx.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_tool_persists_cancelled_results() {
        let mut ctx = context();
        ctx.add_user_message("slow").await.unwrap();
        let tools = Arc::new(RecordingTools::default());
        let turn = executor(
            vec![Ok(tool_step(vec![call("c1", "slow", "{}"), call("c2", "echo", "{}")]))],
            tools,
            gate(ApprovalMode::AutoApprove),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Cancelled);

        let history = ctx.history().await.unwrap();
        let results: Vec<_> = history.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|m| m.metadata.tool_outcome == Some(ToolOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn queued_message_gets_one_more_iteration() {
        let mut ctx = context();
        ctx.add_user_message("first").await.unwrap();
        ctx.queue().push(ctx.session_id(), Message::user("and another thing")).await;
        let turn = executor(
            vec![Ok(text_step("answer one")), Ok(text_step("answer two"))],
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::Manual),
        );

        let sink = RunEventSink::new(ctx.session_id().clone());
        let outcome = turn
            .execute(&mut ctx, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.text, "answer two");
        let texts: Vec<String> = ctx.history().await.unwrap().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["first", "answer one", "and another thing", "answer two"]);
    }

    #[tokio::test]
    async fn streamed_chunks_precede_response() {
        let mut ctx = context();
        ctx.add_user_message("stream").await.unwrap();
        let executor = Arc::new(
            ScriptedExecutor::new(vec![Ok(text_step("hello world"))])
                .with_chunks(vec![StepChunk::Text("hello ".into()), StepChunk::Text("world".into())]),
        );
        let turn = TurnExecutor::new(
            executor,
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::Manual),
        )
        .with_strategy(Arc::new(NoopStrategy));
        let (sink, mut rx) = RunEventSink::channel(ctx.session_id().clone());

        turn.execute(&mut ctx, &sink, &CancellationToken::new()).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            names(&events),
            vec!["llm:thinking", "llm:chunk", "llm:chunk", "llm:response", "run:complete"]
        );
    }

    #[tokio::test]
    async fn overflow_compacts_between_steps() {
        let mut ctx = context().with_max_tokens(1000);
        for i in 0..5 {
            ctx.add_user_message(format!("question {i}")).await.unwrap();
            ctx.add_assistant_message(format!("answer {i}"), vec![], None).await.unwrap();
        }
        ctx.add_user_message("now list the files").await.unwrap();

        let mut overflowing = tool_step(vec![call("c1", "echo", "{}")]);
        overflowing.usage = Some(Usage::new(1200, 10));
        let scripted = Arc::new(ScriptedExecutor::new(vec![Ok(overflowing), Ok(text_step("done"))]));
        let turn = TurnExecutor::new(
            scripted.clone(),
            Arc::new(RecordingTools::default()),
            gate(ApprovalMode::AutoApprove),
        )
        .with_strategy(Arc::new(ReactiveSummaryStrategy::new(CompactionConfig::default())));
        let (sink, mut rx) = RunEventSink::channel(ctx.session_id().clone());

        turn.execute(&mut ctx, &sink, &CancellationToken::new()).await.unwrap();

        let events = drain(&mut rx);
        let compacted = events
            .iter()
            .find_map(|e| match e {
                RunEvent::ContextCompacted { strategy, before_messages, after_messages, .. } => {
                    Some((strategy.clone(), *before_messages, *after_messages))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(compacted.0, "reactive-summary");
        assert!(compacted.2 < compacted.1);

        let requests = scripted.requests();
        assert!(requests[1].messages.len() < requests[0].messages.len() + 2);
        assert!(requests[1].messages[0].is_summary());
    }
}
