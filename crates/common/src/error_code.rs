//! Protocol-level error codes shared by every layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-visible classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoSuchTransaction,
    TransactionCommitted,
    TransactionNumberTooOld,
    TransactionInProgress,
    PreparedTransactionInProgress,
    SessionConflict,
    WriteConflict,
    Interrupted,
    TooLateToAddParticipant,
    DuplicateKey,
    ParticipantUnreachable,
    CoordinatorSteppingDown,
    DecisionIndeterminate,
    InvariantViolation,
    Internal,
}

impl ErrorCode {
    /// Errors after which the client should start a fresh transaction attempt.
    pub fn is_transient_transaction_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::NoSuchTransaction
                | ErrorCode::WriteConflict
                | ErrorCode::TooLateToAddParticipant
                | ErrorCode::ParticipantUnreachable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
