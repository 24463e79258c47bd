//! Session context: history ownership, formatting, and token accounting.
//!
//! | Piece      | Role |
//! |------------|------|
//! | `manager`  | Appends messages, builds the provider view, triggers compaction |
//! | `filter`   | Read-time projection around summary markers |
//! | `sanitize` | Caps tool output before it is stored |
//! | `token`    | Default character-based token estimator |

pub mod filter;
pub mod manager;
pub mod sanitize;
pub mod token;

pub use filter::{CompactionScope, compaction_scope, filter_history, latest_summary_index};
pub use manager::{CompactionReport, ContextManager, TokenEstimate};
pub use sanitize::{sanitize_tool_output, truncate_text};
pub use token::HeuristicEstimator;
