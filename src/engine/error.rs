use thiserror::Error;

use crate::models::membership::{MembershipAction, MembershipStatus};

/// Reasons an event is refused for good. The processor must not redeliver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("malformed event: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permanent rejection: {0}")]
    PermanentRejection(#[from] RejectionReason),
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),
    #[error("compare-and-swap retries exhausted for {0}")]
    CasExhausted(String),
    #[error("cascade queue is closed")]
    QueueClosed,
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("cannot {action} a membership that is {from}")]
    InvalidTransition {
        from: MembershipStatus,
        action: MembershipAction,
    },
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Transient failures: the caller should retry the whole operation,
    /// which is safe because every entry point is idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_) | EngineError::CasExhausted(_) | EngineError::QueueClosed
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, EngineError::PermanentRejection(_))
    }
}
