//! Error types for the coordinator

use shardtx_common::{AbortReason, ErrorCode, ParticipantId, TxnId};
use shardtx_log::LogError;
use shardtx_participant::TransportError;
use shardtx_session::SessionError;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("Transaction {txn} aborted: {reason}")]
    TransactionAborted { txn: TxnId, reason: AbortReason },

    #[error("Transaction {0} already committed")]
    TransactionCommitted(TxnId),

    #[error("Commit of {0} has already started")]
    CommitInProgress(TxnId),

    #[error("Operation on {participant} failed: {source}")]
    OperationFailed {
        participant: ParticipantId,
        #[source]
        source: TransportError,
    },

    #[error("Coordinator is stepping down")]
    SteppingDown,

    #[error("Decision for {0} is unknown until the log is recovered")]
    DecisionIndeterminate(TxnId),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl CoordinatorError {
    /// Code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::Session(e) => e.code(),
            CoordinatorError::Log(e) => e.code(),
            CoordinatorError::TransactionAborted { reason, .. } => reason.code(),
            CoordinatorError::TransactionCommitted(_) => ErrorCode::TransactionCommitted,
            CoordinatorError::CommitInProgress(_) => ErrorCode::TransactionInProgress,
            CoordinatorError::OperationFailed { source, .. } => source.code(),
            CoordinatorError::SteppingDown => ErrorCode::CoordinatorSteppingDown,
            CoordinatorError::DecisionIndeterminate(_) => ErrorCode::DecisionIndeterminate,
            CoordinatorError::InvariantViolation(_) => ErrorCode::InvariantViolation,
        }
    }

    /// Errors that must halt protocol progress rather than be retried
    pub fn is_fatal(&self) -> bool {
        match self {
            CoordinatorError::Log(e) => e.is_fatal(),
            CoordinatorError::InvariantViolation(_) => true,
            _ => false,
        }
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
