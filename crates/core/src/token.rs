//! Token estimator trait.

use crate::message::Message;

/// Counts tokens for a set of messages.
///
/// Must be deterministic for a given message set and model family; the
/// context manager relies on this for stable compaction decisions.
pub trait TokenEstimator: Send + Sync {
    fn name(&self) -> &str;

    fn count_tokens(&self, messages: &[Message]) -> usize;

    fn count_message(&self, message: &Message) -> usize {
        self.count_tokens(std::slice::from_ref(message))
    }
}
