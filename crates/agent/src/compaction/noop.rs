use async_trait::async_trait;
use loopwright_core::error::Result;
use loopwright_core::message::Message;

use super::{CompactionInput, CompactionStrategy};

/// Disables compaction: always declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStrategy;

#[async_trait]
impl CompactionStrategy for NoopStrategy {
    fn name(&self) -> &str {
        "noop"
    }

    async fn compact(&self, _input: CompactionInput<'_>) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwright_core::message::SessionId;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn always_declines() {
        let stored: Vec<Message> = (0..50).map(|i| Message::user(format!("m{i}"))).collect();
        let output = NoopStrategy
            .compact(CompactionInput {
                session_id: &SessionId::from("s"),
                stored: &stored,
                max_tokens: 1,
                cancel: &CancellationToken::new(),
            })
            .await
            .unwrap();
        assert!(output.is_empty());
    }
}
