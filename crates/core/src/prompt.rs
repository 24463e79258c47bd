//! System prompt collaborator.

use async_trait::async_trait;

use crate::message::SessionId;

/// Supplies the system prompt. Called once per step so prompts may change
/// between steps of the same run.
#[async_trait]
pub trait SystemPromptProvider: Send + Sync {
    async fn system_prompt(&self, session_id: &SessionId) -> Option<String>;
}

/// A fixed prompt, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticSystemPrompt(pub Option<String>);

impl StaticSystemPrompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self(Some(prompt.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SystemPromptProvider for StaticSystemPrompt {
    async fn system_prompt(&self, _session_id: &SessionId) -> Option<String> {
        self.0.clone().filter(|p| !p.trim().is_empty())
    }
}
