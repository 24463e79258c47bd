//! Read-time filtering around compaction summary markers.
//!
//! Stored history is never edited. Once a summary marker exists, the view
//! handed to the model is:
//!
//! ```text
//! [marker] ++ stored[count..marker] (non-summary) ++ stored[marker+1..]
//! ```
//!
//! where `count` is the marker's `original_message_count`, the number of
//! leading stored messages it stands in for. A marker without a usable count
//! shows only itself and what follows it.

use loopwright_core::message::Message;

/// Index of the most recent summary marker.
pub fn latest_summary_index(stored: &[Message]) -> Option<usize> {
    stored.iter().rposition(Message::is_summary)
}

/// Stored indices of every message in the filtered view except the marker.
pub fn visible_indices(stored: &[Message]) -> Vec<usize> {
    let Some(idx) = latest_summary_index(stored) else {
        return (0..stored.len()).collect();
    };
    let mut indices = Vec::new();
    if let Some(count) = preserved_start(stored, idx) {
        indices.extend((count..idx).filter(|&i| !stored[i].is_summary()));
    }
    indices.extend(idx + 1..stored.len());
    indices
}

fn preserved_start(stored: &[Message], marker: usize) -> Option<usize> {
    stored[marker]
        .metadata
        .original_message_count
        .filter(|&count| count <= marker)
}

/// Project stored history into what the model sees. Pure.
pub fn filter_history(stored: &[Message]) -> Vec<Message> {
    let marker = latest_summary_index(stored).map(|idx| stored[idx].clone());
    marker
        .into_iter()
        .chain(visible_indices(stored).into_iter().map(|i| stored[i].clone()))
        .collect()
}

/// What the next compaction pass may work on.
#[derive(Debug)]
pub struct CompactionScope<'a> {
    /// The latest existing marker, if any
    pub marker: Option<&'a Message>,
    /// Messages kept verbatim by the latest marker; they leave the view if
    /// a new marker is written, so a summarizer must account for them
    pub preserved: Vec<&'a Message>,
    /// Stored index of each entry in `preserved`
    pub preserved_at: Vec<usize>,
    /// Messages strictly after the latest marker (or all of history)
    pub candidates: &'a [Message],
    /// Stored index of `candidates[0]`
    pub offset: usize,
}

impl<'a> CompactionScope<'a> {
    pub fn is_recompaction(&self) -> bool {
        self.marker.is_some()
    }

    /// Every non-marker message of the current view, in order: the
    /// preserved window followed by the candidates.
    pub fn visible(&self) -> Vec<&'a Message> {
        self.preserved
            .iter()
            .copied()
            .chain(self.candidates.iter())
            .collect()
    }

    /// Stored index of `visible()[i]`.
    pub fn stored_index(&self, i: usize) -> usize {
        match self.preserved_at.get(i) {
            Some(&at) => at,
            None => self.offset + (i - self.preserved_at.len()),
        }
    }
}

pub fn compaction_scope(stored: &[Message]) -> CompactionScope<'_> {
    match latest_summary_index(stored) {
        None => CompactionScope {
            marker: None,
            preserved: Vec::new(),
            preserved_at: Vec::new(),
            candidates: stored,
            offset: 0,
        },
        Some(idx) => {
            let preserved_at: Vec<usize> = preserved_start(stored, idx)
                .map(|count| (count..idx).filter(|&i| !stored[i].is_summary()).collect())
                .unwrap_or_default();
            CompactionScope {
                marker: Some(&stored[idx]),
                preserved: preserved_at.iter().map(|&i| &stored[i]).collect(),
                preserved_at,
                candidates: &stored[idx + 1..],
                offset: idx + 1,
            }
        }
    }
}
