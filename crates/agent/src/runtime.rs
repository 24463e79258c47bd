//! The runtime facade callers drive sessions through.
//!
//! An [`Agent`] owns one [`ContextManager`] per session and allows at most one
//! active run per session; runs on different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use loopwright_approval::{ApprovalGate, ApprovalPolicy};
use loopwright_config::{AppConfig, ContextConfig};
use loopwright_core::approval::{ApprovalRequest, ApprovalResponse, DenialReason};
use loopwright_core::error::{Error, Result};
use loopwright_core::event::{EventBus, SessionEvent};
use loopwright_core::history::HistoryStore;
use loopwright_core::message::{Content, Message, SessionId};
use loopwright_core::prompt::{StaticSystemPrompt, SystemPromptProvider};
use loopwright_core::queue::{InMemoryMessageQueue, MessageQueue};
use loopwright_core::resource::ResourceResolver;
use loopwright_core::step::StepExecutor;
use loopwright_core::token::TokenEstimator;
use loopwright_core::tool::{ToolExecutor, ToolRegistry};
use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::compaction::{CompactionStrategy, StrategyDeps, StrategyRegistry};
use crate::context::{ContextManager, HeuristicEstimator};
use crate::loop_runner::{RunOutcome, TurnExecutor};
use crate::stream_event::{RunEventSink, RunStream};

type SessionSlot = Arc<tokio::sync::Mutex<ContextManager>>;

struct AgentInner {
    step_executor: Arc<dyn StepExecutor>,
    store: Arc<dyn HistoryStore>,
    tools: Arc<dyn ToolExecutor>,
    gate: Arc<ApprovalGate>,
    strategy: Arc<dyn CompactionStrategy>,
    queue: Arc<dyn MessageQueue>,
    system_prompt: Arc<dyn SystemPromptProvider>,
    resolver: Option<Arc<dyn ResourceResolver>>,
    estimator: Arc<dyn TokenEstimator>,
    context: ContextConfig,
    max_steps: usize,
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<SessionId, SessionSlot>>,
    active: Mutex<HashMap<SessionId, CancellationToken>>,
}

/// Cheap to clone; clones share sessions, gate and event bus.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Unregisters a run's cancellation token when the run ends, however it ends.
struct ActiveRun {
    agent: Agent,
    session_id: SessionId,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.agent.active().remove(&self.session_id);
    }
}

impl Agent {
    pub fn builder(step_executor: Arc<dyn StepExecutor>) -> AgentBuilder {
        AgentBuilder::new(step_executor)
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionSlot>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, CancellationToken>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn new_context(&self, session_id: &SessionId) -> ContextManager {
        let inner = &self.inner;
        let ctx = ContextManager::new(session_id.clone(), inner.store.clone())
            .with_config(&inner.context)
            .with_estimator(inner.estimator.clone())
            .with_system_prompt(inner.system_prompt.clone())
            .with_queue(inner.queue.clone());
        match &inner.resolver {
            Some(resolver) => ctx.with_resolver(resolver.clone()),
            None => ctx,
        }
    }

    /// Take the session's context exclusively, or fail with `SessionBusy`.
    fn lock_session(&self, session_id: &SessionId) -> Result<OwnedMutexGuard<ContextManager>> {
        let slot = self
            .sessions()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(self.new_context(session_id))))
            .clone();
        slot.try_lock_owned()
            .map_err(|_| Error::SessionBusy(session_id.to_string()))
    }

    fn begin_run(&self, session_id: &SessionId) -> (CancellationToken, ActiveRun) {
        let cancel = CancellationToken::new();
        self.active().insert(session_id.clone(), cancel.clone());
        let guard = ActiveRun {
            agent: self.clone(),
            session_id: session_id.clone(),
        };
        (cancel, guard)
    }

    fn turn_executor(&self) -> TurnExecutor {
        let inner = &self.inner;
        TurnExecutor::new(inner.step_executor.clone(), inner.tools.clone(), inner.gate.clone())
            .with_strategy(inner.strategy.clone())
            .with_max_steps(inner.max_steps)
    }

    // ── Runs ─────────────────────────────────────────────────

    /// Seed a user message and drive one run to completion.
    pub async fn run(&self, session_id: &SessionId, input: impl Into<Content>) -> Result<RunOutcome> {
        let mut ctx = self.lock_session(session_id)?;
        ctx.add_user_message(input).await?;
        let (cancel, _active) = self.begin_run(session_id);
        let sink = RunEventSink::new(session_id.clone()).with_bus(self.inner.bus.clone());
        self.turn_executor().execute(&mut ctx, &sink, &cancel).await
    }

    /// Like [`run`](Self::run) but returns only the final text.
    pub async fn generate(&self, session_id: &SessionId, input: impl Into<Content>) -> Result<String> {
        Ok(self.run(session_id, input).await?.text)
    }

    /// Start a run in the background and stream its events.
    ///
    /// Busy sessions and malformed input fail here, before any event is sent.
    pub async fn stream(&self, session_id: &SessionId, input: impl Into<Content>) -> Result<RunStream> {
        let mut ctx = self.lock_session(session_id)?;
        ctx.add_user_message(input).await?;
        let (cancel, active) = self.begin_run(session_id);
        let (sink, rx) = RunEventSink::channel(session_id.clone());
        let sink = sink.with_bus(self.inner.bus.clone());
        let executor = self.turn_executor();

        let handle = tokio::spawn(async move {
            let _active = active;
            executor.execute(&mut ctx, &sink, &cancel).await
        });
        Ok(RunStream::new(rx, handle))
    }

    // ── Session control ──────────────────────────────────────

    /// Queue a follow-up for the session. An active run picks it up before
    /// finishing; otherwise the next run's view includes it.
    pub async fn queue_message(&self, session_id: &SessionId, content: impl Into<Content>) -> Result<()> {
        let message = Message::user(content);
        message.validate()?;
        self.inner.queue.push(session_id, message).await;
        debug!(%session_id, "Message queued");
        Ok(())
    }

    pub fn respond_approval(&self, response: ApprovalResponse) -> Result<()> {
        Ok(self.inner.gate.respond(response)?)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.inner.gate.pending_requests()
    }

    /// Cancel the session's active run and its outstanding approvals.
    /// Returns whether a run was active.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let token = self.active().get(session_id).cloned();
        if let Some(token) = &token {
            token.cancel();
        }
        let cancelled_approvals = self
            .inner
            .gate
            .cancel_all(Some(session_id), DenialReason::UserCancelled);
        if token.is_some() {
            info!(%session_id, cancelled_approvals, "Run cancelled");
        }
        token.is_some()
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.active().contains_key(session_id)
    }

    /// Clear the session's history and queue. Idempotent; fails while a run
    /// is active.
    pub async fn reset_session(&self, session_id: &SessionId) -> Result<()> {
        let mut ctx = self.lock_session(session_id)?;
        ctx.reset().await
    }

    // ── Reads ────────────────────────────────────────────────

    /// Raw stored history, summary markers included.
    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        Ok(self.inner.store.read(session_id).await?)
    }

    /// What the model would be sent for the session right now.
    pub async fn formatted_messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        self.new_context(session_id).get_formatted_messages().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.inner.bus.subscribe()
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.inner.gate
    }

    pub fn strategy_name(&self) -> &str {
        self.inner.strategy.name()
    }
}

pub struct AgentBuilder {
    step_executor: Arc<dyn StepExecutor>,
    config: AppConfig,
    store: Option<Arc<dyn HistoryStore>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    gate: Option<Arc<ApprovalGate>>,
    registry: Option<StrategyRegistry>,
    summarizer: Option<Arc<dyn StepExecutor>>,
    system_prompt: Option<Arc<dyn SystemPromptProvider>>,
    queue: Option<Arc<dyn MessageQueue>>,
    resolver: Option<Arc<dyn ResourceResolver>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    bus: Option<Arc<EventBus>>,
}

impl AgentBuilder {
    pub fn new(step_executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            step_executor,
            config: AppConfig::default(),
            store: None,
            tools: None,
            gate: None,
            registry: None,
            summarizer: None,
            system_prompt: None,
            queue: None,
            resolver: None,
            estimator: None,
            bus: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the backend named in `[history]`.
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Defaults to a gate built from `[approval]`.
    pub fn with_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Defaults to [`StrategyRegistry::with_defaults`].
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Model used for compaction summaries. Defaults to the step executor.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn StepExecutor>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_system_prompt(mut self, provider: Arc<dyn SystemPromptProvider>) -> Self {
        self.system_prompt = Some(provider);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Fails on an unknown compaction strategy tag or an unavailable store.
    pub async fn build(self) -> Result<Agent> {
        let config = self.config;
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(HeuristicEstimator));
        let summarizer = self
            .summarizer
            .unwrap_or_else(|| self.step_executor.clone());
        let deps = StrategyDeps::new(config.compaction.clone())
            .with_summarizer(summarizer)
            .with_estimator(estimator.clone());
        let strategy = self
            .registry
            .unwrap_or_else(StrategyRegistry::with_defaults)
            .create(&config.compaction.strategy, &deps)?;

        let store = match self.store {
            Some(store) => store,
            None => loopwright_history::open(&config.history).await?,
        };
        let gate = self.gate.unwrap_or_else(|| {
            Arc::new(ApprovalGate::new(ApprovalPolicy::from_config(&config.approval)))
        });

        info!(
            executor = self.step_executor.name(),
            history = store.name(),
            strategy = strategy.name(),
            max_steps = config.runtime.max_steps,
            "Agent ready"
        );

        Ok(Agent {
            inner: Arc::new(AgentInner {
                step_executor: self.step_executor,
                store,
                tools: self.tools.unwrap_or_else(|| Arc::new(ToolRegistry::new())),
                gate,
                strategy,
                queue: self
                    .queue
                    .unwrap_or_else(|| Arc::new(InMemoryMessageQueue::new())),
                system_prompt: self
                    .system_prompt
                    .unwrap_or_else(|| Arc::new(StaticSystemPrompt::none())),
                resolver: self.resolver,
                estimator,
                context: config.context,
                max_steps: config.runtime.max_steps,
                bus: self.bus.unwrap_or_default(),
                sessions: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingTools, ScriptedExecutor, call, text_step, tool_step};
    use futures::StreamExt;
    use loopwright_config::ApprovalMode;
    use loopwright_core::event::RunEvent;
    use loopwright_core::step::FinishReason;
    use loopwright_history::InMemoryHistory;

    async fn agent(executor: ScriptedExecutor, mode: ApprovalMode) -> Agent {
        let mut config = AppConfig::default();
        config.approval.mode = mode;
        Agent::builder(Arc::new(executor))
            .with_config(config)
            .with_history(Arc::new(InMemoryHistory::new()))
            .with_tools(Arc::new(RecordingTools::default()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn generate_returns_final_text() {
        let agent = agent(ScriptedExecutor::new(vec![Ok(text_step("hello"))]), ApprovalMode::Manual).await;
        let session = SessionId::from("s");
        assert_eq!(agent.generate(&session, "hi").await.unwrap(), "hello");
        assert_eq!(agent.history(&session).await.unwrap().len(), 2);
        assert!(!agent.is_running(&session));
    }

    #[tokio::test]
    async fn unknown_strategy_fails_build() {
        let mut config = AppConfig::default();
        config.compaction.strategy = "magic".into();
        let result = Agent::builder(Arc::new(ScriptedExecutor::new(vec![])))
            .with_config(config)
            .with_history(Arc::new(InMemoryHistory::new()))
            .build()
            .await;
        assert!(matches!(result, Err(Error::UnknownStrategy(_))));
    }

    #[tokio::test]
    async fn stream_orders_events_thinking_first_complete_last() {
        let agent = agent(
            ScriptedExecutor::new(vec![
                Ok(tool_step(vec![call("c1", "echo", "{}")])),
                Ok(text_step("done")),
            ]),
            ApprovalMode::AutoApprove,
        )
        .await;
        let mut stream = agent.stream(&SessionId::from("s"), "go").await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        assert_eq!(events.first().map(RunEvent::name), Some("llm:thinking"));
        assert_eq!(events.last().map(RunEvent::name), Some("run:complete"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(outcome.steps, 2);
    }

    #[tokio::test]
    async fn second_run_on_busy_session_is_rejected() {
        let agent = agent(ScriptedExecutor::new(vec![]).blocking(), ApprovalMode::Manual).await;
        let session = SessionId::from("s");
        let stream = agent.stream(&session, "first").await.unwrap();

        let err = agent.run(&session, "second").await.unwrap_err();
        assert!(matches!(err, Error::SessionBusy(_)));
        assert!(matches!(
            agent.reset_session(&session).await,
            Err(Error::SessionBusy(_))
        ));

        // Other sessions are unaffected
        assert!(agent.formatted_messages(&SessionId::from("other")).await.unwrap().is_empty());

        assert!(agent.cancel(&session));
        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Cancelled);
        assert!(!agent.is_running(&session));
    }

    #[tokio::test]
    async fn cancel_resolves_pending_approval() {
        let agent = agent(
            ScriptedExecutor::new(vec![Ok(tool_step(vec![call("c1", "shell", "{}")]))]),
            ApprovalMode::Manual,
        )
        .await;
        let session = SessionId::from("s");
        let stream = agent.stream(&session, "run it").await.unwrap();

        while agent.pending_approvals().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(agent.cancel(&session));

        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Cancelled);
        let history = agent.history(&session).await.unwrap();
        assert!(history.last().unwrap().text().starts_with("[Cancelled]"));
    }

    #[tokio::test]
    async fn respond_approval_unblocks_run() {
        let agent = agent(
            ScriptedExecutor::new(vec![
                Ok(tool_step(vec![call("c1", "shell", "{}")])),
                Ok(text_step("ran it")),
            ]),
            ApprovalMode::Manual,
        )
        .await;
        let session = SessionId::from("s");
        let stream = agent.stream(&session, "run it").await.unwrap();

        let request = loop {
            if let Some(request) = agent.pending_approvals().into_iter().next() {
                break request;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(request.session_id.as_ref(), Some(&session));
        agent
            .respond_approval(ApprovalResponse::approved(&request.approval_id))
            .unwrap();
        assert!(agent
            .respond_approval(ApprovalResponse::approved(&request.approval_id))
            .is_err());

        assert_eq!(stream.finish().await.unwrap().text, "ran it");
    }

    #[tokio::test]
    async fn reset_clears_history_idempotently() {
        let agent = agent(ScriptedExecutor::new(vec![Ok(text_step("hello"))]), ApprovalMode::Manual).await;
        let session = SessionId::from("s");
        agent.run(&session, "hi").await.unwrap();
        agent.reset_session(&session).await.unwrap();
        agent.reset_session(&session).await.unwrap();
        assert!(agent.history(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_queue_message_is_rejected() {
        let agent = agent(ScriptedExecutor::new(vec![]), ApprovalMode::Manual).await;
        let err = agent
            .queue_message(
                &SessionId::from("s"),
                vec![loopwright_core::message::ContentPart::Resource {
                    uri: " ".into(),
                    mime_type: None,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn events_reach_the_bus() {
        let agent = agent(ScriptedExecutor::new(vec![Ok(text_step("hello"))]), ApprovalMode::Manual).await;
        let mut rx = agent.subscribe();
        agent.run(&SessionId::from("s"), "hi").await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event.name());
        }
        assert_eq!(names.first(), Some(&"llm:thinking"));
        assert_eq!(names.last(), Some(&"run:complete"));
    }
}
