//! Tool output sanitization.
//!
//! Raw tool output is opaque JSON. Before it is stored it is turned into
//! message content and every text part is capped at a character budget so a
//! single oversized result cannot blow the context window on its own.

use loopwright_core::message::{Content, ContentPart};

/// Convert raw tool output into stored content, truncating each text part to
/// `max_chars` characters.
///
/// - a JSON string becomes text
/// - an array of typed content parts is kept as parts
/// - anything else is pretty-printed JSON
pub fn sanitize_tool_output(raw: &serde_json::Value, max_chars: usize) -> Content {
    match raw {
        serde_json::Value::String(text) => Content::Text(truncate_text(text, max_chars)),
        serde_json::Value::Array(items) if !items.is_empty() => {
            match serde_json::from_value::<Vec<ContentPart>>(raw.clone()) {
                Ok(parts) => Content::Parts(
                    parts
                        .into_iter()
                        .map(|part| match part {
                            ContentPart::Text { text } => ContentPart::Text {
                                text: truncate_text(&text, max_chars),
                            },
                            other => other,
                        })
                        .collect(),
                ),
                Err(_) => Content::Text(truncate_text(&pretty(raw), max_chars)),
            }
        }
        serde_json::Value::Null => Content::Text(String::new()),
        other => Content::Text(truncate_text(&pretty(other), max_chars)),
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Keep the first `max_chars` characters and append a truncation marker.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!(
        "{kept}\n\n[Output truncated: showing first {max_chars} of {total} characters]"
    )
}
