//! Compaction strategies.
//!
//! A strategy looks at a session's stored history and returns either nothing
//! (decline) or exactly one summary marker to append. Strategies never edit
//! or delete stored messages; the read-time filter in
//! [`context::filter`](crate::context::filter) is what hides summarized
//! messages from the model.
//!
//! | Tag                | Strategy                       | Calls a model |
//! |--------------------|--------------------------------|---------------|
//! | `reactive-summary` | [`ReactiveSummaryStrategy`]    | yes, with a deterministic fallback |
//! | `oldest-eviction`  | [`OldestEvictionStrategy`]     | no            |
//! | `noop`             | [`NoopStrategy`]               | no            |

pub mod eviction;
pub mod noop;
pub mod registry;
pub mod summarize;

pub use eviction::OldestEvictionStrategy;
pub use noop::NoopStrategy;
pub use registry::{StrategyDeps, StrategyFactory, StrategyRegistry};
pub use summarize::ReactiveSummaryStrategy;

use async_trait::async_trait;
use loopwright_core::error::Result;
use loopwright_core::message::{Message, SessionId};
use tokio_util::sync::CancellationToken;

/// Everything a strategy gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct CompactionInput<'a> {
    pub session_id: &'a SessionId,
    /// Full stored history, including earlier markers
    pub stored: &'a [Message],
    /// The context budget the view should fit into
    pub max_tokens: usize,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    /// Registry tag, also reported in `context:compacted` events.
    fn name(&self) -> &str;

    /// Return `[]` to decline or `[summary]` to append.
    async fn compact(&self, input: CompactionInput<'_>) -> Result<Vec<Message>>;
}
