//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. This is
//! accurate within ~10% for BPE tokenizers on English text and is fully
//! deterministic, which is what compaction decisions need.

use loopwright_core::message::{Content, ContentPart, Message};
use loopwright_core::step::ToolDefinition;
use loopwright_core::token::TokenEstimator;

/// Flat cost charged for an image part.
const IMAGE_TOKENS: usize = 765;

/// Per-message overhead for role name, delimiters, and formatting markers.
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn estimate_part_tokens(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } => estimate_tokens(text),
        ContentPart::Image { .. } => IMAGE_TOKENS,
        ContentPart::File { data, url, .. } => data
            .as_deref()
            .or(url.as_deref())
            .map_or(0, estimate_tokens),
        ContentPart::Resource { uri, .. } => estimate_tokens(uri),
    }
}

fn estimate_content_tokens(content: &Content) -> usize {
    match content {
        Content::Text(text) => estimate_tokens(text),
        Content::Parts(parts) => parts.iter().map(estimate_part_tokens).sum(),
    }
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments))
        .sum();
    let reasoning = message.reasoning.as_deref().map_or(0, estimate_tokens);
    MESSAGE_OVERHEAD + estimate_content_tokens(&message.content) + calls + reasoning
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for a slice of tool definitions (serialized as JSON).
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools
        .iter()
        .map(|t| estimate_tokens(&serde_json::to_string(t).unwrap_or_default()))
        .sum()
}

/// The default [`TokenEstimator`]: the 4-chars-per-token heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn count_tokens(&self, messages: &[Message]) -> usize {
        estimate_messages_tokens(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwright_core::message::MessageToolCall;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn message_includes_overhead() {
        let msg = Message::user("test"); // 1 token + 4 overhead
        assert_eq!(estimate_message_tokens(&msg), 5);
    }

    #[test]
    fn multiple_messages() {
        let msgs = vec![Message::user("hello"), Message::assistant("world")];
        assert_eq!(HeuristicEstimator.count_tokens(&msgs), 12);
    }

    #[test]
    fn tool_calls_are_counted() {
        let plain = Message::assistant("");
        let with_call = Message::assistant_with_tool_calls(
            "",
            vec![MessageToolCall::new("c1", "search", r#"{"query":"rust"}"#)],
        );
        assert!(estimate_message_tokens(&with_call) > estimate_message_tokens(&plain));
    }

    #[test]
    fn images_have_flat_cost() {
        let msg = Message::user(vec![ContentPart::Image {
            data: None,
            url: Some("https://example.com/x.png".into()),
            mime_type: "image/png".into(),
        }]);
        assert_eq!(estimate_message_tokens(&msg), MESSAGE_OVERHEAD + IMAGE_TOKENS);
    }

    #[test]
    fn estimate_is_deterministic() {
        let msgs = vec![Message::user("same input"), Message::assistant("same output")];
        assert_eq!(
            HeuristicEstimator.count_tokens(&msgs),
            HeuristicEstimator.count_tokens(&msgs)
        );
    }

    #[test]
    fn empty_tools_is_zero() {
        assert_eq!(estimate_tools_tokens(&[]), 0);
    }
}
