//! Audit logging: a record of every terminal approval outcome.

use chrono::{DateTime, Utc};
use loopwright_core::approval::{ApprovalKind, ApprovalRequest, ApprovalResponse, DenialReason};
use loopwright_core::message::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub approval_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub kind: ApprovalKind,
    /// Tool name, or the kind for non-tool requests
    pub target: String,
    pub outcome: AuditOutcome,
    pub decided_by: Decider,
}

/// Outcome of an audited approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Approved,
    Denied { reason: DenialReason },
}

impl AuditOutcome {
    pub fn from_response(response: &ApprovalResponse) -> Self {
        match response.denial_reason() {
            None => Self::Approved,
            Some(reason) => Self::Denied { reason },
        }
    }
}

/// Who made the decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decider {
    /// Configured mode or auto-approve list
    Policy,
    /// An external responder
    Responder,
    /// Timer expiry
    Timeout,
    /// Cancellation signal or bulk cancel
    Cancellation,
}

/// Trait for audit log sinks (where entries are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// In-memory audit log that also forwards entries to sinks.
pub struct AuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }
}

impl AuditLogger {
    /// Create a new audit logger with no sinks.
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Create a new audit logger with the given sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks,
        }
    }

    /// Record the outcome of `request`.
    pub fn log(&self, request: &ApprovalRequest, response: &ApprovalResponse, decided_by: Decider) {
        let target = request
            .details
            .tool_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", request.kind()).to_lowercase());

        let entry = AuditEntry {
            timestamp: Utc::now(),
            approval_id: request.approval_id.clone(),
            session_id: request.session_id.clone(),
            kind: request.kind(),
            target,
            outcome: AuditOutcome::from_response(response),
            decided_by,
        };

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());

        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    /// Get all recorded entries.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries for one session.
    pub fn entries_for(&self, session_id: &SessionId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.session_id.as_ref() == Some(session_id))
            .cloned()
            .collect()
    }

    /// Clear all stored entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Count of stored entries.
    pub fn count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A tracing-based audit sink that logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            approval_id = %entry.approval_id,
            session_id = ?entry.session_id,
            kind = ?entry.kind,
            target = %entry.target,
            outcome = ?entry.outcome,
            decided_by = ?entry.decided_by,
            "AUDIT"
        );
    }
}
