//! Approval gate: the request/response broker for pending decisions.
//!
//! A caller `begin`s a request. The policy may resolve it on the spot;
//! otherwise it is parked in the outstanding map and the caller `wait`s.
//! Exactly one of these resolves it:
//! - `respond` with a matching approval id
//! - the per-request timer (timeout denial)
//! - the caller's cancellation token, `cancel`, or `cancel_all`
//!
//! Removal from the outstanding map is the single point of resolution, so a
//! second response for the same id is rejected instead of double-resolving.
//! Dropping a [`PendingApproval`] without waiting on it withdraws the request.

use loopwright_core::approval::{
    ApprovalDetails, ApprovalKind, ApprovalRequest, ApprovalResponse, DenialReason,
};
use loopwright_core::error::ApprovalError;
use loopwright_core::message::SessionId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditLogger, Decider};
use crate::policy::{ApprovalPolicy, PolicyDecision};

struct Outstanding {
    request: ApprovalRequest,
    tx: oneshot::Sender<(ApprovalResponse, Decider)>,
}

type OutstandingMap = Mutex<HashMap<String, Outstanding>>;

fn lock(map: &OutstandingMap) -> MutexGuard<'_, HashMap<String, Outstanding>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of starting an approval.
#[derive(Debug)]
pub enum ApprovalTicket {
    /// Decided by policy without waiting
    Resolved {
        request: ApprovalRequest,
        response: ApprovalResponse,
    },
    /// Parked until a response, timeout, or cancellation
    Pending(PendingApproval),
}

impl ApprovalTicket {
    pub fn request(&self) -> &ApprovalRequest {
        match self {
            Self::Resolved { request, .. } => request,
            Self::Pending(pending) => &pending.request,
        }
    }
}

/// Handle for an outstanding request.
pub struct PendingApproval {
    request: ApprovalRequest,
    rx: oneshot::Receiver<(ApprovalResponse, Decider)>,
    outstanding: Arc<OutstandingMap>,
}

impl PendingApproval {
    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }
}

impl fmt::Debug for PendingApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingApproval")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingApproval {
    fn drop(&mut self) {
        if lock(&self.outstanding)
            .remove(&self.request.approval_id)
            .is_some()
        {
            debug!(approval_id = %self.request.approval_id, "Pending approval abandoned");
        }
    }
}

/// Process-wide approval broker.
pub struct ApprovalGate {
    policy: Arc<ApprovalPolicy>,
    outstanding: Arc<OutstandingMap>,
    audit: Arc<AuditLogger>,
    /// Someone is able to answer `Ask` decisions
    responder_attached: bool,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            audit: Arc::new(AuditLogger::default()),
            responder_attached: true,
        }
    }

    /// A gate nobody answers. Decisions the policy cannot make fail with
    /// [`ApprovalError::NotConfigured`] instead of waiting out the timeout.
    pub fn headless(policy: ApprovalPolicy) -> Self {
        Self {
            responder_attached: false,
            ..Self::new(policy)
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    fn outstanding(&self) -> MutexGuard<'_, HashMap<String, Outstanding>> {
        lock(&self.outstanding)
    }

    /// Start an approval. Never leaves a request unresolved: either it is
    /// decided now or the returned handle must be passed to [`wait`](Self::wait).
    pub fn begin(
        &self,
        details: ApprovalDetails,
        session_id: Option<&SessionId>,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let mut request = ApprovalRequest::new(details, self.policy.timeout());
        if let Some(session_id) = session_id {
            request = request.with_session(session_id.clone());
        }

        match self.policy.decide(&request.details) {
            PolicyDecision::Approve => {
                let response = ApprovalResponse::approved(&request.approval_id);
                debug!(approval_id = %request.approval_id, "Approved by policy");
                self.audit.log(&request, &response, Decider::Policy);
                Ok(ApprovalTicket::Resolved { request, response })
            }
            PolicyDecision::Deny(reason) => {
                let response = ApprovalResponse::denied(&request.approval_id, reason);
                debug!(approval_id = %request.approval_id, %reason, "Denied by policy");
                self.audit.log(&request, &response, Decider::Policy);
                Ok(ApprovalTicket::Resolved { request, response })
            }
            PolicyDecision::Ask => {
                if !self.responder_attached {
                    return Err(ApprovalError::NotConfigured);
                }
                let (tx, rx) = oneshot::channel();
                self.outstanding().insert(
                    request.approval_id.clone(),
                    Outstanding {
                        request: request.clone(),
                        tx,
                    },
                );
                debug!(approval_id = %request.approval_id, kind = ?request.kind(), "Approval pending");
                Ok(ApprovalTicket::Pending(PendingApproval {
                    request,
                    rx,
                    outstanding: self.outstanding.clone(),
                }))
            }
        }
    }

    /// Block until the pending request resolves.
    pub async fn wait(&self, mut pending: PendingApproval, cancel: &CancellationToken) -> ApprovalResponse {
        let request = pending.request.clone();

        let expired = tokio::select! {
            biased;
            answered = &mut pending.rx => match answered {
                Ok(resolution) => return self.finish(&request, resolution),
                Err(_) => DenialReason::SystemCancelled,
            },
            _ = cancel.cancelled() => DenialReason::UserCancelled,
            _ = tokio::time::sleep(request.timeout()) => DenialReason::Timeout,
        };

        // Whoever removes the entry owns the resolution.
        let removed = self.outstanding().remove(&request.approval_id).is_some();
        if !removed && let Ok(resolution) = pending.rx.try_recv() {
            return self.finish(&request, resolution);
        }

        if expired == DenialReason::Timeout {
            warn!(approval_id = %request.approval_id, timeout_ms = request.timeout_ms, "Approval timed out");
        }
        let decider = match expired {
            DenialReason::Timeout => Decider::Timeout,
            _ => Decider::Cancellation,
        };
        self.finish(
            &request,
            (ApprovalResponse::denied(&request.approval_id, expired), decider),
        )
    }

    /// Convenience: `begin` + `wait`.
    pub async fn request_approval(
        &self,
        details: ApprovalDetails,
        session_id: Option<&SessionId>,
        cancel: &CancellationToken,
    ) -> Result<ApprovalResponse, ApprovalError> {
        match self.begin(details, session_id)? {
            ApprovalTicket::Resolved { response, .. } => Ok(response),
            ApprovalTicket::Pending(pending) => Ok(self.wait(pending, cancel).await),
        }
    }

    fn finish(&self, request: &ApprovalRequest, resolution: (ApprovalResponse, Decider)) -> ApprovalResponse {
        let (response, decider) = resolution;
        if response.remember()
            && let Some(tool) = request.details.tool_name()
        {
            self.policy.remember(tool);
        }
        self.audit.log(request, &response, decider);
        response
    }

    /// Deliver an external response. Rejects unknown or already-resolved ids
    /// and malformed responses; a rejected response leaves the request pending.
    pub fn respond(&self, response: ApprovalResponse) -> Result<(), ApprovalError> {
        let mut outstanding = self.outstanding();
        let entry = outstanding
            .get(&response.approval_id)
            .ok_or_else(|| ApprovalError::UnknownRequest(response.approval_id.clone()))?;

        if entry.request.kind() == ApprovalKind::Elicitation
            && response.is_approved()
            && !response.data.as_ref().is_some_and(|d| !d.is_null())
        {
            return Err(ApprovalError::InvalidResponse(
                "an approved elicitation must carry response data".into(),
            ));
        }

        let Some(entry) = outstanding.remove(&response.approval_id) else {
            return Err(ApprovalError::UnknownRequest(response.approval_id));
        };
        drop(outstanding);

        debug!(approval_id = %response.approval_id, approved = response.is_approved(), "Approval answered");
        // A dropped receiver means the waiter already gave up; nothing to do.
        let _ = entry.tx.send((response, Decider::Responder));
        Ok(())
    }

    /// Resolve one outstanding request as a cancellation-denial.
    pub fn cancel(&self, approval_id: &str, reason: DenialReason) -> bool {
        let Some(entry) = self.outstanding().remove(approval_id) else {
            return false;
        };
        let _ = entry.tx.send((
            ApprovalResponse::denied(approval_id, reason),
            Decider::Cancellation,
        ));
        true
    }

    /// Resolve every outstanding request (optionally only one session's) as
    /// cancelled. Returns how many were resolved.
    pub fn cancel_all(&self, session_id: Option<&SessionId>, reason: DenialReason) -> usize {
        let drained: Vec<Outstanding> = {
            let mut outstanding = self.outstanding();
            let ids: Vec<String> = outstanding
                .iter()
                .filter(|(_, o)| session_id.is_none() || o.request.session_id.as_ref() == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| outstanding.remove(id)).collect()
        };

        let count = drained.len();
        for entry in drained {
            let response = ApprovalResponse::denied(&entry.request.approval_id, reason);
            let _ = entry.tx.send((response, Decider::Cancellation));
        }
        if count > 0 {
            debug!(count, %reason, "Cancelled outstanding approvals");
        }
        count
    }

    /// Requests currently waiting for a response.
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> =
            self.outstanding().values().map(|o| o.request.clone()).collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(ApprovalPolicy::default())
    }
}
