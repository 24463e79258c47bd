//! Mechanical oldest-first eviction.
//!
//! Hides the oldest visible messages until the view fits a fraction of the
//! budget, keeping a minimum trailing window. Nothing is summarized: the
//! marker only says how much was dropped and carries any earlier summary
//! forward.

use std::sync::Arc;

use async_trait::async_trait;
use loopwright_config::CompactionConfig;
use loopwright_core::error::Result;
use loopwright_core::message::{Message, Role};
use loopwright_core::token::TokenEstimator;
use tracing::debug;

use super::{CompactionInput, CompactionStrategy};
use crate::context::filter::{latest_summary_index, visible_indices};

pub struct OldestEvictionStrategy {
    min_trailing: usize,
    target_ratio: f64,
    estimator: Arc<dyn TokenEstimator>,
}

impl OldestEvictionStrategy {
    pub fn new(config: &CompactionConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            min_trailing: config.eviction_min_trailing,
            target_ratio: config.eviction_target_ratio,
            estimator,
        }
    }
}

#[async_trait]
impl CompactionStrategy for OldestEvictionStrategy {
    fn name(&self) -> &str {
        "oldest-eviction"
    }

    async fn compact(&self, input: CompactionInput<'_>) -> Result<Vec<Message>> {
        let stored = input.stored;
        let marker = latest_summary_index(stored).map(|i| &stored[i]);
        let visible = visible_indices(stored);

        let sizes: Vec<usize> = visible
            .iter()
            .map(|&i| self.estimator.count_message(&stored[i]))
            .collect();
        let mut total: usize =
            sizes.iter().sum::<usize>() + marker.map_or(0, |m| self.estimator.count_message(m));
        let target = (input.max_tokens as f64 * self.target_ratio) as usize;

        let max_drop = visible.len().saturating_sub(self.min_trailing);
        let mut drop = 0;
        while drop < max_drop && total > target {
            total -= sizes[drop];
            drop += 1;
        }
        // Keep the call that a leading tool result answers.
        while drop > 0 && drop < visible.len() && stored[visible[drop]].role == Role::Tool {
            drop -= 1;
        }

        if drop < 2 {
            debug!(
                session_id = %input.session_id,
                visible = visible.len(),
                "Nothing worth evicting"
            );
            return Ok(Vec::new());
        }

        let first_kept = visible.get(drop).copied().unwrap_or(stored.len());
        let mut text =
            format!("[{drop} earlier messages were removed to fit the context window.]");
        if let Some(previous) = marker {
            text.push_str("\n\nEarlier summary:\n");
            text.push_str(&previous.text());
        }
        Ok(vec![Message::summary(text, first_kept, marker.is_some())])
    }
}
