//! Approval request/response types shared by the gate and the turn loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::message::SessionId;

/// What kind of decision is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    ToolConfirmation,
    Elicitation,
    Custom,
}

/// Type-specific payload of an approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalDetails {
    ToolConfirmation {
        tool_name: String,
        tool_call_id: String,
        arguments: serde_json::Value,
    },
    Elicitation {
        prompt: String,
        schema: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },
    Custom {
        payload: serde_json::Value,
    },
}

impl ApprovalDetails {
    pub fn kind(&self) -> ApprovalKind {
        match self {
            Self::ToolConfirmation { .. } => ApprovalKind::ToolConfirmation,
            Self::Elicitation { .. } => ApprovalKind::Elicitation,
            Self::Custom { .. } => ApprovalKind::Custom,
        }
    }

    /// Tool name, if this is a tool confirmation.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolConfirmation { tool_name, .. } => Some(tool_name),
            _ => None,
        }
    }
}

/// A pending decision the loop cannot make unilaterally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Milliseconds before the request resolves as a timeout denial
    pub timeout_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub details: ApprovalDetails,
}

impl ApprovalRequest {
    pub fn new(details: ApprovalDetails, timeout: Duration) -> Self {
        Self {
            approval_id: format!("apr_{}", Uuid::new_v4().simple()),
            session_id: None,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
            details,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn kind(&self) -> ApprovalKind {
        self.details.kind()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Machine-readable reason attached to every denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    UserDenied,
    SystemDenied,
    Timeout,
    UserCancelled,
    SystemCancelled,
    ElicitationDisabled,
    ValidationFailed,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserDenied => "user_denied",
            Self::SystemDenied => "system_denied",
            Self::Timeout => "timeout",
            Self::UserCancelled => "user_cancelled",
            Self::SystemCancelled => "system_cancelled",
            Self::ElicitationDisabled => "elicitation_disabled",
            Self::ValidationFailed => "validation_failed",
        }
    }

    /// Text persisted as the tool output when a call is refused.
    pub fn tool_output(&self, tool_name: &str) -> String {
        match self {
            Self::UserDenied => format!("[Denied] The user declined to run `{tool_name}`."),
            Self::SystemDenied => {
                format!("[Denied] Policy does not allow `{tool_name}` to run.")
            }
            Self::Timeout => {
                format!("[Denied] No approval for `{tool_name}` arrived before the timeout.")
            }
            Self::UserCancelled | Self::SystemCancelled => {
                format!("[Cancelled] The call to `{tool_name}` was cancelled.")
            }
            Self::ElicitationDisabled => {
                format!("[Denied] `{tool_name}` needs input but elicitation is disabled.")
            }
            Self::ValidationFailed => {
                format!("[Denied] The approval response for `{tool_name}` was invalid.")
            }
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelled | Self::SystemCancelled)
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Denied { reason: DenialReason },
}

/// The answer to exactly one [`ApprovalRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approval_id: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApprovalResponse {
    pub fn approved(approval_id: impl Into<String>) -> Self {
        Self {
            approval_id: approval_id.into(),
            status: ApprovalStatus::Approved,
            data: None,
        }
    }

    pub fn denied(approval_id: impl Into<String>, reason: DenialReason) -> Self {
        Self {
            approval_id: approval_id.into(),
            status: ApprovalStatus::Denied { reason },
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.status, ApprovalStatus::Approved)
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self.status {
            ApprovalStatus::Approved => None,
            ApprovalStatus::Denied { reason } => Some(reason),
        }
    }

    /// The responder asked for this decision to be remembered.
    pub fn remember(&self) -> bool {
        self.is_approved()
            && self
                .data
                .as_ref()
                .and_then(|d| d.get("remember"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}
