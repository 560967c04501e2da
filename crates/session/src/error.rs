//! Error types for the session catalog

use shardtx_common::{ErrorCode, ParticipantId, SessionId, TxnId, TxnNumber, TxnState};
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session catalog error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} was killed while waiting to check it out")]
    SessionConflict(SessionId),

    #[error("txnNumber {requested} on session {session} is too old; last is {last}")]
    TransactionNumberTooOld {
        session: SessionId,
        requested: TxnNumber,
        last: TxnNumber,
    },

    #[error("Transaction {0} is already in progress")]
    TransactionInProgress(TxnId),

    #[error("Transaction {0} is prepared and cannot be superseded")]
    PreparedTransactionInProgress(TxnId),

    #[error("No such transaction {0}")]
    NoSuchTransaction(TxnId),

    #[error("Participant {0} cannot join after prepare has begun")]
    TooLateToAddParticipant(ParticipantId),

    #[error("Participant list was already frozen")]
    AlreadyFrozen,

    #[error("Participant {0} is not part of this transaction")]
    UnknownParticipant(ParticipantId),

    #[error("Transaction {txn} cannot move from {from} to {to}")]
    InvalidTransition {
        txn: TxnId,
        from: TxnState,
        to: TxnState,
    },

    #[error("Operation interrupted")]
    Interrupted,
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::SessionConflict(_) => ErrorCode::SessionConflict,
            SessionError::TransactionNumberTooOld { .. } => ErrorCode::TransactionNumberTooOld,
            SessionError::TransactionInProgress(_) => ErrorCode::TransactionInProgress,
            SessionError::PreparedTransactionInProgress(_) => {
                ErrorCode::PreparedTransactionInProgress
            }
            SessionError::NoSuchTransaction(_) => ErrorCode::NoSuchTransaction,
            SessionError::TooLateToAddParticipant(_) => ErrorCode::TooLateToAddParticipant,
            SessionError::Interrupted => ErrorCode::Interrupted,
            SessionError::AlreadyFrozen
            | SessionError::UnknownParticipant(_)
            | SessionError::InvalidTransition { .. } => ErrorCode::Internal,
        }
    }
}

impl From<shardtx_common::Interrupted> for SessionError {
    fn from(_: shardtx_common::Interrupted) -> Self {
        SessionError::Interrupted
    }
}
