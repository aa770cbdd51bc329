//! Per-request state machine.
//!
//! ```text
//! Received → ContextLoaded → Generating → Committing → Completed
//!     └──────────┴──────────────┴─────────────┴──→ Rejected | Failed
//! ```

use tracing::debug;
use turnstile_core::error::{FailureOrigin, ServiceError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    ContextLoaded,
    Generating,
    Committing,
    Completed,
    Rejected,
    Failed,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Received => "received",
            RequestPhase::ContextLoaded => "context_loaded",
            RequestPhase::Generating => "generating",
            RequestPhase::Committing => "committing",
            RequestPhase::Completed => "completed",
            RequestPhase::Rejected => "rejected",
            RequestPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::Rejected | RequestPhase::Failed
        )
    }

    /// Whether `next` may follow `self`.
    ///
    /// Input can only be rejected before generation starts; any live phase
    /// may fail.
    pub fn can_transition_to(&self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        match (self, next) {
            (Received, ContextLoaded)
            | (ContextLoaded, Generating)
            | (Generating, Committing)
            | (Committing, Completed) => true,
            (Received | ContextLoaded, Rejected) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the phase of one request and logs every transition.
#[derive(Debug)]
pub struct PhaseTracker {
    request_id: Uuid,
    phase: RequestPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            phase: RequestPhase::Received,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn advance(&mut self, next: RequestPhase) -> Result<(), ServiceError> {
        if !self.phase.can_transition_to(next) {
            return Err(ServiceError::Failed {
                origin: FailureOrigin::Internal,
                detail: format!("illegal request transition {} -> {}", self.phase, next),
            });
        }
        debug!(request_id = %self.request_id, from = %self.phase, to = %next, "Request phase");
        self.phase = next;
        Ok(())
    }

    /// Record the terminal state matching `error`.
    pub fn fail(&mut self, error: &ServiceError) {
        let target = match error {
            ServiceError::Rejected { .. } if self.phase.can_transition_to(RequestPhase::Rejected) => {
                RequestPhase::Rejected
            }
            _ => RequestPhase::Failed,
        };
        if self.phase.can_transition_to(target) {
            debug!(request_id = %self.request_id, from = %self.phase, to = %target, "Request phase");
            self.phase = target;
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
