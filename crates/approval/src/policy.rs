//! Approval policy: which decisions can be made without asking anyone.
//!
//! Rules, checked in order for tool confirmations:
//! - Tool matches `auto_approve_tools` or a remembered pattern → approve
//! - Mode `auto-approve` → approve
//! - Mode `auto-deny` → deny (`system_denied`)
//! - Otherwise → ask
//!
//! Patterns are an exact tool name, `"*"`, or a `prefix*` glob.

use loopwright_config::{ApprovalConfig, ApprovalMode};
use loopwright_core::approval::{ApprovalDetails, DenialReason};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Result of checking a request against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Approve,
    Deny(DenialReason),
    /// Needs an external response
    Ask,
}

/// Approval policy shared by the gate and the turn loop.
#[derive(Debug)]
pub struct ApprovalPolicy {
    mode: ApprovalMode,
    timeout: Duration,
    auto_approve: Vec<String>,
    remembered: RwLock<Vec<String>>,
    elicitation_enabled: bool,
}

impl ApprovalPolicy {
    pub fn new(mode: ApprovalMode) -> Self {
        Self {
            mode,
            timeout: Duration::from_secs(120),
            auto_approve: Vec::new(),
            remembered: RwLock::new(Vec::new()),
            elicitation_enabled: true,
        }
    }

    pub fn from_config(config: &ApprovalConfig) -> Self {
        Self {
            mode: config.mode,
            timeout: Duration::from_secs(config.timeout_secs),
            auto_approve: config.auto_approve_tools.clone(),
            remembered: RwLock::new(Vec::new()),
            elicitation_enabled: config.elicitation_enabled,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auto_approve(mut self, patterns: Vec<String>) -> Self {
        self.auto_approve = patterns;
        self
    }

    pub fn with_elicitation(mut self, enabled: bool) -> Self {
        self.elicitation_enabled = enabled;
        self
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `tool_name` skips the gate entirely.
    pub fn is_auto_approved(&self, tool_name: &str) -> bool {
        if self.auto_approve.iter().any(|p| matches_pattern(p, tool_name)) {
            return true;
        }
        self.remembered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| matches_pattern(p, tool_name))
    }

    /// Remember an approval so future calls to the tool skip the gate.
    pub fn remember(&self, pattern: &str) {
        let mut remembered = self
            .remembered
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !remembered.iter().any(|p| p == pattern) {
            debug!(pattern, "Remembering approval pattern");
            remembered.push(pattern.to_string());
        }
    }

    pub fn remembered(&self) -> Vec<String> {
        self.remembered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn decide(&self, details: &ApprovalDetails) -> PolicyDecision {
        match details {
            ApprovalDetails::ToolConfirmation { tool_name, .. } => {
                if self.is_auto_approved(tool_name) {
                    return PolicyDecision::Approve;
                }
                match self.mode {
                    ApprovalMode::AutoApprove => PolicyDecision::Approve,
                    ApprovalMode::AutoDeny => PolicyDecision::Deny(DenialReason::SystemDenied),
                    ApprovalMode::Manual => PolicyDecision::Ask,
                }
            }
            // Elicitations need data from a person; auto-approve cannot supply it.
            ApprovalDetails::Elicitation { .. } => {
                if !self.elicitation_enabled {
                    PolicyDecision::Deny(DenialReason::ElicitationDisabled)
                } else if self.mode == ApprovalMode::AutoDeny {
                    PolicyDecision::Deny(DenialReason::SystemDenied)
                } else {
                    PolicyDecision::Ask
                }
            }
            ApprovalDetails::Custom { .. } => match self.mode {
                ApprovalMode::AutoApprove => PolicyDecision::Approve,
                ApprovalMode::AutoDeny => PolicyDecision::Deny(DenialReason::SystemDenied),
                ApprovalMode::Manual => PolicyDecision::Ask,
            },
        }
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::from_config(&ApprovalConfig::default())
    }
}

/// Exact name, `"*"`, or `prefix*`.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}
