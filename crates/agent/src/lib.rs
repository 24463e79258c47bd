//! The Loopwright agent runtime.
//!
//! A run follows a bounded **step → tools → step** cycle:
//!
//! 1. **Seed** the user message into the session history
//! 2. **Format** the view: system prompt, filtered history, queued messages
//! 3. **Call** the step executor with the view and the enabled tools
//! 4. **If tool calls**: approve, execute and persist each result, compact on
//!    overflow, loop back to step 2
//! 5. **Otherwise**: persist the answer and finish, unless a follow-up was
//!    queued meanwhile
//!
//! The loop ends on a non-tool finish, `max_steps`, cancellation, or a fatal
//! error; `run:complete` is always the last event.

pub mod compaction;
pub mod context;
pub mod loop_runner;
pub mod runtime;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use compaction::{
    CompactionInput, CompactionStrategy, NoopStrategy, OldestEvictionStrategy,
    ReactiveSummaryStrategy, StrategyDeps, StrategyFactory, StrategyRegistry,
};
pub use context::{
    CompactionReport, ContextManager, HeuristicEstimator, TokenEstimate, filter_history,
};
pub use loop_runner::{RunOutcome, TurnExecutor};
pub use runtime::{Agent, AgentBuilder};
pub use stream_event::{RunEventSink, RunStream};
