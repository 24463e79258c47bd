//! Per-session context manager.
//!
//! The only component that appends to a session's history or decides what a
//! read of it returns. Owned exclusively by the turn executor running that
//! session.

use std::sync::Arc;

use loopwright_config::ContextConfig;
use loopwright_core::error::{Error, Result, ValidationError};
use loopwright_core::history::HistoryStore;
use loopwright_core::message::{
    Content, ContentPart, Message, MessageToolCall, Role, SessionId, ToolOutcome,
};
use loopwright_core::prompt::{StaticSystemPrompt, SystemPromptProvider};
use loopwright_core::queue::{InMemoryMessageQueue, MessageQueue};
use loopwright_core::resource::ResourceResolver;
use loopwright_core::step::ToolDefinition;
use loopwright_core::token::TokenEstimator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::filter::filter_history;
use super::sanitize::sanitize_tool_output;
use super::token::{HeuristicEstimator, estimate_tools_tokens};
use crate::compaction::{CompactionInput, CompactionStrategy};

/// Token usage of the current formatted view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    /// Estimator count over the formatted view plus the tool definitions
    pub estimated: usize,
    /// Input tokens reported by the last completed model call
    pub actual: Option<u64>,
}

impl TokenEstimate {
    /// The actual count when known, the estimate otherwise.
    pub fn effective(&self) -> u64 {
        self.actual.unwrap_or(self.estimated as u64)
    }
}

/// What a compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub strategy: String,
    pub before_tokens: usize,
    pub after_tokens: usize,
    pub before_messages: usize,
    pub after_messages: usize,
}

pub struct ContextManager {
    session_id: SessionId,
    store: Arc<dyn HistoryStore>,
    estimator: Arc<dyn TokenEstimator>,
    system_prompt: Arc<dyn SystemPromptProvider>,
    queue: Arc<dyn MessageQueue>,
    resolver: Option<Arc<dyn ResourceResolver>>,
    max_tokens: usize,
    trigger_ratio: f64,
    tool_output_max_chars: usize,
    tool_tokens: usize,
    last_actual_input_tokens: Option<u64>,
}

impl ContextManager {
    pub fn new(session_id: SessionId, store: Arc<dyn HistoryStore>) -> Self {
        let defaults = ContextConfig::default();
        Self {
            session_id,
            store,
            estimator: Arc::new(HeuristicEstimator),
            system_prompt: Arc::new(StaticSystemPrompt::none()),
            queue: Arc::new(InMemoryMessageQueue::new()),
            resolver: None,
            max_tokens: defaults.max_tokens,
            trigger_ratio: defaults.trigger_ratio,
            tool_output_max_chars: defaults.tool_output_max_chars,
            tool_tokens: 0,
            last_actual_input_tokens: None,
        }
    }

    pub fn with_config(mut self, config: &ContextConfig) -> Self {
        self.max_tokens = config.max_tokens;
        self.trigger_ratio = config.trigger_ratio;
        self.tool_output_max_chars = config.tool_output_max_chars;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_system_prompt(mut self, provider: Arc<dyn SystemPromptProvider>) -> Self {
        self.system_prompt = provider;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    pub fn last_actual_input_tokens(&self) -> Option<u64> {
        self.last_actual_input_tokens
    }

    /// Tool definitions sent alongside every view count towards the estimate.
    pub fn set_tool_definitions(&mut self, tools: &[ToolDefinition]) {
        self.tool_tokens = estimate_tools_tokens(tools);
    }

    // ── Appends ──────────────────────────────────────────────

    pub async fn add_user_message(&self, content: impl Into<Content>) -> Result<Message> {
        let message = Message::user(content);
        self.append_message(&message).await?;
        Ok(message)
    }

    pub async fn add_assistant_message(
        &self,
        text: impl Into<String>,
        tool_calls: Vec<MessageToolCall>,
        reasoning: Option<String>,
    ) -> Result<Message> {
        let mut message = Message::assistant_with_tool_calls(text, tool_calls);
        message.reasoning = reasoning;
        self.append_message(&message).await?;
        Ok(message)
    }

    /// Sanitize raw tool output and persist it as a tool result.
    ///
    /// Fails with [`ValidationError::OrphanToolResult`] unless an assistant
    /// message already in history requested `tool_call_id`.
    pub async fn add_tool_result(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        raw: &serde_json::Value,
        outcome: ToolOutcome,
    ) -> Result<Message> {
        let stored = self.store.read(&self.session_id).await?;
        let requested = stored.iter().rev().any(|m| {
            m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == tool_call_id)
        });
        if !requested {
            return Err(ValidationError::OrphanToolResult(tool_call_id.to_string()).into());
        }

        let content = sanitize_tool_output(raw, self.tool_output_max_chars);
        let message = Message::tool_result(tool_call_id, tool_name, content, outcome);
        self.append_message(&message).await?;
        Ok(message)
    }

    /// Validate and append any message. Summary markers go through
    /// [`compact_now`](Self::compact_now) instead.
    pub async fn append_message(&self, message: &Message) -> Result<()> {
        message.validate().map_err(|e| match e {
            ValidationError::OrphanToolResult(_) => {
                ValidationError::OrphanToolResult(message.id.clone())
            }
            other => other,
        })?;
        self.store.append(&self.session_id, message).await?;
        debug!(session_id = %self.session_id, role = %message.role, "Message appended");
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────

    /// The raw stored sequence, markers and all.
    pub async fn history(&self) -> Result<Vec<Message>> {
        Ok(self.store.read(&self.session_id).await?)
    }

    /// Provider-ready view: system prompt, filtered history, queued user
    /// messages, with resource references expanded. Never mutates history.
    pub async fn get_formatted_messages(&self) -> Result<Vec<Message>> {
        let stored = self.store.read(&self.session_id).await?;
        let mut view = Vec::with_capacity(stored.len() + 1);

        if let Some(prompt) = self.system_prompt.system_prompt(&self.session_id).await {
            view.push(Message::system(prompt));
        }
        view.extend(filter_history(&stored));
        view.extend(self.queue.pending(&self.session_id).await);

        for message in &mut view {
            if message.content.has_resources() {
                message.content = self.expand_resources(&message.content).await;
            }
        }
        Ok(view)
    }

    async fn expand_resources(&self, content: &Content) -> Content {
        let Content::Parts(parts) = content else {
            return content.clone();
        };
        let mut expanded = Vec::with_capacity(parts.len());
        for part in parts {
            let ContentPart::Resource { uri, mime_type } = part else {
                expanded.push(part.clone());
                continue;
            };
            let resolved = match &self.resolver {
                Some(resolver) => resolver.resolve(uri, mime_type.as_deref()).await,
                None => None,
            };
            match resolved {
                Some(parts) => expanded.extend(parts),
                None => {
                    debug!(%uri, "Resource could not be resolved");
                    expanded.push(ContentPart::text(format!("[Unavailable resource: {uri}]")));
                }
            }
        }
        Content::Parts(expanded)
    }

    pub async fn get_context_token_estimate(&self) -> Result<TokenEstimate> {
        let view = self.get_formatted_messages().await?;
        Ok(TokenEstimate {
            estimated: self.estimator.count_tokens(&view) + self.tool_tokens,
            actual: self.last_actual_input_tokens,
        })
    }

    pub fn record_actual_usage(&mut self, input_tokens: u64) {
        self.last_actual_input_tokens = Some(input_tokens);
    }

    /// Whether usage (actual when known) is past `max_tokens × trigger_ratio`.
    pub async fn should_compact(&self) -> Result<bool> {
        let threshold = self.max_tokens as f64 * self.trigger_ratio;
        let used = match self.last_actual_input_tokens {
            Some(actual) => actual,
            None => self.get_context_token_estimate().await?.estimated as u64,
        };
        Ok(used as f64 > threshold)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Compact only when over budget.
    pub async fn maybe_compact(
        &mut self,
        strategy: &dyn CompactionStrategy,
        cancel: &CancellationToken,
    ) -> Result<Option<CompactionReport>> {
        if !self.should_compact().await? {
            return Ok(None);
        }
        self.compact_now(strategy, cancel).await
    }

    /// Run `strategy` regardless of usage and append what it returns.
    pub async fn compact_now(
        &mut self,
        strategy: &dyn CompactionStrategy,
        cancel: &CancellationToken,
    ) -> Result<Option<CompactionReport>> {
        let stored = self.store.read(&self.session_id).await?;
        let before = self.get_formatted_messages().await?;
        let before_tokens = self.estimator.count_tokens(&before);

        let output = strategy
            .compact(CompactionInput {
                session_id: &self.session_id,
                stored: &stored,
                max_tokens: self.max_tokens,
                cancel,
            })
            .await?;

        let summary = match <[Message; 1]>::try_from(output) {
            Ok([summary]) => summary,
            Err(output) if output.is_empty() => {
                debug!(session_id = %self.session_id, strategy = strategy.name(), "Compaction declined");
                return Ok(None);
            }
            Err(output) => {
                return Err(invalid_summary(format!(
                    "strategy returned {} messages, expected at most one",
                    output.len()
                )));
            }
        };
        if !summary.is_summary() {
            return Err(invalid_summary("output is not flagged as a summary".into()));
        }
        if summary
            .metadata
            .original_message_count
            .is_some_and(|count| count > stored.len())
        {
            return Err(invalid_summary(format!(
                "summary covers more messages than the {} stored",
                stored.len()
            )));
        }

        self.store.append(&self.session_id, &summary).await?;
        self.last_actual_input_tokens = None;

        let after = self.get_formatted_messages().await?;
        let report = CompactionReport {
            strategy: strategy.name().to_string(),
            before_tokens,
            after_tokens: self.estimator.count_tokens(&after),
            before_messages: before.len(),
            after_messages: after.len(),
        };
        info!(
            session_id = %self.session_id,
            strategy = %report.strategy,
            before_tokens = report.before_tokens,
            after_tokens = report.after_tokens,
            before_messages = report.before_messages,
            after_messages = report.after_messages,
            recompaction = summary.metadata.is_recompaction,
            "Context compacted"
        );
        Ok(Some(report))
    }

    /// Clear history and queued messages. Idempotent.
    pub async fn reset(&mut self) -> Result<()> {
        self.store.reset(&self.session_id).await?;
        self.queue.clear(&self.session_id).await;
        self.last_actual_input_tokens = None;
        info!(session_id = %self.session_id, "Session reset");
        Ok(())
    }

    pub(crate) fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }
}

fn invalid_summary(reason: String) -> Error {
    Error::Validation(ValidationError::InvalidSummary(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::NoopStrategy;
    use async_trait::async_trait;
    use loopwright_history::InMemoryHistory;

    fn manager() -> ContextManager {
        ContextManager::new(SessionId::from("s"), Arc::new(InMemoryHistory::new()))
    }

    struct FixedSummary(Vec<Message>);

    #[async_trait]
    impl CompactionStrategy for FixedSummary {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn compact(&self, _input: CompactionInput<'_>) -> Result<Vec<Message>> {
            Ok(self.0.clone())
        }
    }

    struct Lookup;

    #[async_trait]
    impl ResourceResolver for Lookup {
        async fn resolve(&self, uri: &str, _mime_type: Option<&str>) -> Option<Vec<ContentPart>> {
            (uri == "blob:readme").then(|| vec![ContentPart::text("README contents")])
        }
    }

    #[tokio::test]
    async fn appends_are_ordered_and_counted() {
        let ctx = manager();
        ctx.add_user_message("hi").await.unwrap();
        ctx.add_assistant_message("hello", vec![], None).await.unwrap();
        let history = ctx.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].text(), "hello");
    }

    #[tokio::test]
    async fn malformed_content_is_rejected_without_append() {
        let ctx = manager();
        let err = ctx
            .add_user_message(vec![ContentPart::Image {
                data: None,
                url: None,
                mime_type: "image/png".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::MalformedContent { .. })));
        assert!(!err.is_retryable());
        assert!(ctx.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_result_requires_a_matching_call() {
        let ctx = manager();
        let err = ctx
            .add_tool_result("nope", "shell", &serde_json::json!("x"), ToolOutcome::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::OrphanToolResult(_))));

        ctx.add_assistant_message("", vec![MessageToolCall::new("c1", "shell", "{}")], None)
            .await
            .unwrap();
        let stored = ctx
            .add_tool_result("c1", "shell", &serde_json::json!("x".repeat(50)), ToolOutcome::Success)
            .await;
        assert!(stored.is_ok());
    }

    #[tokio::test]
    async fn tool_output_is_truncated_before_storage() {
        let ctx = manager().with_config(&ContextConfig {
            tool_output_max_chars: 10,
            ..ContextConfig::default()
        });
        ctx.add_assistant_message("", vec![MessageToolCall::new("c1", "cat", "{}")], None)
            .await
            .unwrap();
        let stored = ctx
            .add_tool_result("c1", "cat", &serde_json::json!("y".repeat(100)), ToolOutcome::Success)
            .await
            .unwrap();
        assert!(stored.text().contains("[Output truncated"));
    }

    #[tokio::test]
    async fn formatted_view_prepends_prompt_and_appends_queue() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new());
        let ctx = manager()
            .with_system_prompt(Arc::new(StaticSystemPrompt::new("be brief")))
            .with_queue(queue.clone());
        ctx.add_user_message("first").await.unwrap();
        queue.push(ctx.session_id(), Message::user("queued")).await;

        let view = ctx.get_formatted_messages().await.unwrap();
        let roles: Vec<Role> = view.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User]);
        assert_eq!(view[2].text(), "queued");
        // Queued messages are only peeked
        assert_eq!(ctx.history().await.unwrap().len(), 1);
        assert_eq!(queue.pending(ctx.session_id()).await.len(), 1);
    }

    #[tokio::test]
    async fn formatted_view_is_idempotent() {
        let ctx = manager();
        ctx.add_user_message("a").await.unwrap();
        ctx.add_assistant_message("b", vec![], None).await.unwrap();
        let first = ctx.get_formatted_messages().await.unwrap();
        let second = ctx.get_formatted_messages().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn resources_are_expanded_or_replaced_with_placeholder() {
        let ctx = manager().with_resolver(Arc::new(Lookup));
        ctx.add_user_message(vec![
            ContentPart::text("see"),
            ContentPart::Resource {
                uri: "blob:readme".into(),
                mime_type: None,
            },
            ContentPart::Resource {
                uri: "blob:gone".into(),
                mime_type: None,
            },
        ])
        .await
        .unwrap();

        let view = ctx.get_formatted_messages().await.unwrap();
        let text = view[0].text();
        assert!(text.contains("README contents"));
        assert!(text.contains("[Unavailable resource: blob:gone]"));
        assert!(!view[0].content.has_resources());
        // Stored message still holds the reference
        assert!(ctx.history().await.unwrap()[0].content.has_resources());
    }

    #[tokio::test]
    async fn actual_usage_takes_precedence_over_estimate() {
        let mut ctx = manager().with_max_tokens(1000);
        ctx.add_user_message("short").await.unwrap();
        assert!(!ctx.should_compact().await.unwrap());

        ctx.record_actual_usage(1200);
        let estimate = ctx.get_context_token_estimate().await.unwrap();
        assert_eq!(estimate.actual, Some(1200));
        assert_eq!(estimate.effective(), 1200);
        assert!(ctx.should_compact().await.unwrap());
    }

    #[tokio::test]
    async fn tool_definitions_count_before_the_first_call() {
        let mut ctx = manager().with_max_tokens(100);
        ctx.add_user_message("short").await.unwrap();
        let bare = ctx.get_context_token_estimate().await.unwrap().estimated;
        assert!(!ctx.should_compact().await.unwrap());

        let tool = ToolDefinition {
            name: "search".into(),
            description: "x".repeat(800),
            parameters: serde_json::json!({"type": "object"}),
        };
        ctx.set_tool_definitions(&[tool]);
        let with_tools = ctx.get_context_token_estimate().await.unwrap().estimated;
        assert!(with_tools > bare + 150);
        assert!(ctx.should_compact().await.unwrap());
    }

    #[tokio::test]
    async fn under_budget_does_not_call_strategy() {
        let mut ctx = manager();
        ctx.add_user_message("a").await.unwrap();
        let strategy = FixedSummary(vec![Message::summary("S", 1, false)]);
        let report = ctx
            .maybe_compact(&strategy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_none());
        assert_eq!(ctx.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compaction_appends_marker_and_clears_actual() {
        let mut ctx = manager().with_max_tokens(10);
        for i in 0..4 {
            ctx.add_user_message(format!("message {i}")).await.unwrap();
        }
        ctx.record_actual_usage(500);

        let strategy = FixedSummary(vec![Message::summary("S", 3, false)]);
        let report = ctx
            .maybe_compact(&strategy, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.strategy, "fixed");
        assert_eq!(report.before_messages, 4);
        assert_eq!(report.after_messages, 2);
        assert_eq!(ctx.history().await.unwrap().len(), 5);
        assert_eq!(ctx.last_actual_input_tokens(), None);
    }

    #[tokio::test]
    async fn non_summary_output_is_rejected() {
        let mut ctx = manager();
        ctx.add_user_message("a").await.unwrap();
        let strategy = FixedSummary(vec![Message::user("not a summary")]);
        let err = ctx
            .compact_now(&strategy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidSummary(_))));
        assert_eq!(ctx.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn declined_compaction_leaves_history_alone() {
        let mut ctx = manager();
        ctx.add_user_message("a").await.unwrap();
        let report = ctx
            .compact_now(&NoopStrategy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_none());
        assert_eq!(ctx.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_is_idempotent_and_clears_queue() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new());
        let mut ctx = manager().with_queue(queue.clone());
        ctx.add_user_message("a").await.unwrap();
        queue.push(ctx.session_id(), Message::user("q")).await;

        ctx.reset().await.unwrap();
        ctx.reset().await.unwrap();
        assert!(ctx.history().await.unwrap().is_empty());
        assert!(queue.pending(ctx.session_id()).await.is_empty());
    }
}
