//! Reactive summarization.
//!
//! Summarizes everything after the latest marker except the most recent
//! turns, which stay verbatim. The summary is written by a model; when that
//! call fails a deterministic digest is used instead so compaction can always
//! make progress.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use loopwright_config::CompactionConfig;
use loopwright_core::error::Result;
use loopwright_core::message::{Message, Role};
use loopwright_core::step::{StepExecutor, StepRequest};
use tracing::{debug, warn};

use super::{CompactionInput, CompactionStrategy};
use crate::context::filter::compaction_scope;

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are a precise summarizer. Write concise but complete \
summaries of agent conversations, preserving every technical detail needed to continue the work.";

/// Header every summary starts with, so the model can tell it apart from a
/// real user turn.
pub const SUMMARY_HEADER: &str = "[Conversation summary]";

pub struct ReactiveSummaryStrategy {
    config: CompactionConfig,
    summarizer: Option<Arc<dyn StepExecutor>>,
}

impl ReactiveSummaryStrategy {
    /// Without a summarizer every summary is the deterministic digest.
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn StepExecutor>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Index into `visible` of the first message kept verbatim, or `None`
    /// to decline.
    ///
    /// `visible` is the current view without its marker; only the trailing
    /// `new_messages` of it come after the latest marker. Turns are counted
    /// over the whole view, so a turn whose user message sits in the
    /// previous marker's preserved window still counts as a turn.
    pub fn split_point(&self, visible: &[&Message], new_messages: usize) -> Option<usize> {
        if new_messages <= self.config.min_messages_to_summarize {
            return None;
        }

        let total = visible.len();
        let preserve = self.config.preserve_last_n_turns;
        let turn_starts: Vec<usize> = visible
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect();

        let split = if preserve == 0 {
            total
        } else if turn_starts.len() > preserve {
            // Never eat into the preserved turns, even if little is left to
            // summarize.
            turn_starts[turn_starts.len() - preserve]
        } else {
            let by_ratio = (total as f64 * self.config.fallback_keep_ratio).ceil() as usize;
            let keep = by_ratio.max(self.config.fallback_min_keep);
            let mut split = total.saturating_sub(keep);
            // A kept suffix must not open with a result whose call was summarized.
            while split > 0 && visible[split].role == Role::Tool {
                split -= 1;
            }
            split
        };

        (split >= 2).then_some(split)
    }

    async fn summarize(&self, input: &CompactionInput<'_>, prompt: String) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        let request = StepRequest {
            session_id: input.session_id.clone(),
            step: 0,
            messages: vec![Message::system(SUMMARIZER_SYSTEM_PROMPT), Message::user(prompt)],
            tools: Vec::new(),
        };
        match summarizer.execute(request, input.cancel).await {
            Ok(result) if !result.text.trim().is_empty() => Some(result.text),
            Ok(_) => {
                warn!(session_id = %input.session_id, "Summarizer returned no text, using fallback summary");
                None
            }
            Err(e) => {
                warn!(session_id = %input.session_id, error = %e, "Summarizer failed, using fallback summary");
                None
            }
        }
    }
}

#[async_trait]
impl CompactionStrategy for ReactiveSummaryStrategy {
    fn name(&self) -> &str {
        "reactive-summary"
    }

    async fn compact(&self, input: CompactionInput<'_>) -> Result<Vec<Message>> {
        let scope = compaction_scope(input.stored);
        let visible = scope.visible();
        let Some(split) = self.split_point(&visible, scope.candidates.len()) else {
            debug!(
                session_id = %input.session_id,
                candidates = scope.candidates.len(),
                "Too little to summarize"
            );
            return Ok(Vec::new());
        };

        let to_summarize = &visible[..split];
        let previous = scope.marker.map(Message::text);
        let current_task = input
            .stored
            .iter()
            .rev()
            .find(|m| m.role == Role::User && !m.is_summary())
            .map(Message::text);

        let prompt = build_summary_prompt(
            to_summarize,
            previous.as_deref(),
            current_task.as_deref(),
            self.config.preview_chars,
        );
        let body = match self.summarize(&input, prompt).await {
            Some(text) => text,
            None => fallback_summary(to_summarize, previous.as_deref()),
        };

        let summary = Message::summary(
            format!("{SUMMARY_HEADER}\n\n{}", body.trim()),
            scope.stored_index(split),
            scope.is_recompaction(),
        );
        Ok(vec![summary])
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{prefix}... (truncated)")
}

fn format_transcript(messages: &[&Message], preview_chars: usize) -> String {
    let mut output = String::new();
    for message in messages {
        let text = preview(&message.text(), preview_chars);
        match message.role {
            Role::Tool => {
                let tool = message.tool_name.as_deref().unwrap_or("unknown");
                let _ = writeln!(output, "[tool result: {tool}] {text}");
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
                let _ = writeln!(output, "[assistant] {text} [called tools: {}]", names.join(", "));
            }
            role => {
                let _ = writeln!(output, "[{role}] {text}");
            }
        }
    }
    output
}

/// The prompt handed to the summarizer.
pub fn build_summary_prompt(
    messages: &[&Message],
    previous_summary: Option<&str>,
    current_task: Option<&str>,
    preview_chars: usize,
) -> String {
    let mut prompt = String::from(
        "Summarize the conversation below so the work can continue without it.\n\n\
         Structure the summary in three sections:\n\
         1. Conversation history: what was discussed, decided, and done\n\
         2. Current task: what the user is asking for right now and how far along it is\n\
         3. State to preserve: file paths, identifiers, decisions, errors, and pending next steps\n\n\
         Be specific about technical details (file names, function names, error messages).\n",
    );
    if let Some(previous) = previous_summary {
        let _ = write!(prompt, "\nEarlier summary (already condensed):\n{previous}\n");
    }
    let _ = write!(
        prompt,
        "\nConversation:\n{}",
        format_transcript(messages, preview_chars)
    );
    if let Some(task) = current_task {
        let _ = write!(prompt, "\nCurrent task (latest user message):\n{task}\n");
    }
    prompt
}

/// Digest built without a model: message counts, recent user requests and
/// the tools that were used.
pub fn fallback_summary(messages: &[&Message], previous_summary: Option<&str>) -> String {
    let count = |role: Role| messages.iter().filter(|m| m.role == role).count();

    let mut tools: Vec<&str> = Vec::new();
    for message in messages {
        for call in &message.tool_calls {
            if !tools.contains(&call.name.as_str()) {
                tools.push(&call.name);
            }
        }
    }

    let mut summary = format!(
        "{} earlier messages were condensed ({} user, {} assistant, {} tool results).",
        messages.len(),
        count(Role::User),
        count(Role::Assistant),
        count(Role::Tool)
    );

    let recent_requests: Vec<String> = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User && !m.is_summary())
        .take(3)
        .map(|m| preview(&m.text(), 200))
        .collect();
    if !recent_requests.is_empty() {
        summary.push_str("\n\nRecent user requests:");
        for request in recent_requests.iter().rev() {
            let _ = write!(summary, "\n- {request}");
        }
    }
    if !tools.is_empty() {
        let _ = write!(summary, "\n\nTools used: {}", tools.join(", "));
    }
    if let Some(previous) = previous_summary {
        let _ = write!(summary, "\n\nPreviously summarized:\n{previous}");
    }
    summary
}
