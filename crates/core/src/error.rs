//! Error types for the Loopwright domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Loopwright operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Step executor errors ---
    #[error("Step error: {0}")]
    Step(#[from] StepError),

    // --- History store errors ---
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Approval errors ---
    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    // --- Caller input errors ---
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Runtime ---
    #[error("Session {0} already has an active run")]
    SessionBusy(String),

    #[error("Unknown compaction strategy: {0}")]
    UnknownStrategy(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller's fault; never retried.
    User,
    /// An approval was not answered in time.
    Timeout,
    /// An action was explicitly refused.
    Forbidden,
    /// Infrastructure or provider failure; fatal for the current run.
    System,
}

impl Error {
    /// Whether a calling layer may retry the whole run.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Step(e) => e.is_retryable(),
            Self::History(HistoryError::Storage(_)) => true,
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Config { .. } | Self::UnknownStrategy(_) => {
                ErrorCategory::User
            }
            Self::Approval(ApprovalError::InvalidResponse(_))
            | Self::Approval(ApprovalError::UnknownRequest(_)) => ErrorCategory::User,
            Self::Tool(ToolError::InvalidArguments(_)) => ErrorCategory::User,
            Self::Tool(ToolError::PermissionDenied { .. }) => ErrorCategory::Forbidden,
            Self::Tool(ToolError::Timeout { .. }) | Self::Step(StepError::Timeout(_)) => {
                ErrorCategory::Timeout
            }
            _ => ErrorCategory::System,
        }
    }

    /// An actionable message for the person operating the runtime.
    pub fn user_message(&self) -> String {
        match self {
            Self::Approval(ApprovalError::InvalidResponse(_))
            | Self::Approval(ApprovalError::UnknownRequest(_)) => {
                format!("{self}. Check the approval request structure.")
            }
            Self::Approval(ApprovalError::NotConfigured) => {
                "No approval handler is configured; set approval.mode or attach a responder."
                    .into()
            }
            Self::Validation(_) => format!("{self}. Check the message content parts."),
            Self::Tool(ToolError::InvalidArguments(_)) => {
                format!("{self}. Check the required tool arguments.")
            }
            Self::Step(StepError::RateLimited { retry_after_secs }) => {
                format!("The model provider is rate limiting requests; retry in {retry_after_secs}s.")
            }
            Self::SessionBusy(_) => {
                format!("{self}. Wait for it to finish or cancel it first.")
            }
            _ => self.to_string(),
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model call timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Step executor not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    #[error("Model call cancelled")]
    Cancelled,
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted history entry: {0}")]
    Serialization(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum ApprovalError {
    #[error("No approval provider is configured")]
    NotConfigured,

    #[error("Invalid approval response: {0}")]
    InvalidResponse(String),

    #[error("No pending approval with id {0}")]
    UnknownRequest(String),
}

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Malformed content part at index {index}: {reason}")]
    MalformedContent { index: usize, reason: String },

    #[error("Tool result references unknown tool call {0}")]
    OrphanToolResult(String),

    #[error("Invalid summary message: {0}")]
    InvalidSummary(String),

    #[error("Empty message content")]
    EmptyContent,
}
