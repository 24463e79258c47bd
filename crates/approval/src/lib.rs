//! Approval handling for Loopwright: policy, gate, and audit logging.
//!
//! Provides:
//! - **Policy**: which decisions are made without asking (mode, auto-approve
//!   patterns, remembered approvals, elicitation switch)
//! - **Gate**: the request/response broker the turn loop blocks on
//! - **Audit logging**: a record of every terminal approval outcome

pub mod audit;
pub mod gate;
pub mod policy;

pub use audit::{AuditEntry, AuditLogger, AuditOutcome, AuditSink, Decider, TracingSink};
pub use gate::{ApprovalGate, ApprovalTicket, PendingApproval};
pub use policy::{ApprovalPolicy, PolicyDecision, matches_pattern};
