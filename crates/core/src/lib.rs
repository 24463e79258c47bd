//! # Loopwright Core
//!
//! Domain types, collaborator traits, and error definitions for the Loopwright
//! agent runtime. Nothing in here talks to a network or a disk: the turn loop,
//! context manager, and approval gate are written against these traits, and
//! the concrete backends live in their own crates.
//!
//! ## Collaborators
//!
//! - [`StepExecutor`] performs one bounded model call
//! - [`TokenEstimator`] counts tokens for a set of messages
//! - [`HistoryStore`] persists the append-only message log per session
//! - [`ToolExecutor`] runs a tool by name
//! - [`SystemPromptProvider`], [`MessageQueue`], [`ResourceResolver`] feed the
//!   formatted view handed to the model

pub mod approval;
pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod prompt;
pub mod queue;
pub mod resource;
pub mod step;
pub mod token;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use approval::{
    ApprovalDetails, ApprovalKind, ApprovalRequest, ApprovalResponse, ApprovalStatus,
    DenialReason,
};
pub use error::{Error, ErrorCategory, Result};
pub use event::{EventBus, RunEvent, SessionEvent};
pub use history::HistoryStore;
pub use message::{
    Content, ContentPart, Message, MessageMetadata, MessageToolCall, Role, SessionId, ToolOutcome,
};
pub use prompt::{StaticSystemPrompt, SystemPromptProvider};
pub use queue::{InMemoryMessageQueue, MessageQueue};
pub use resource::ResourceResolver;
pub use step::{FinishReason, StepChunk, StepExecutor, StepRequest, StepResult, ToolDefinition, Usage};
pub use token::TokenEstimator;
pub use tool::{Tool, ToolExecutor, ToolRegistry};
