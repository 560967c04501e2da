//! Error types for the transaction log

use shardtx_common::{DecisionRecord, ErrorCode, TxnId};
use thiserror::Error;

/// Result type for transaction log operations
pub type Result<T> = std::result::Result<T, LogError>;

/// Transaction log error types
#[derive(Error, Debug)]
pub enum LogError {
    /// A different decision is already durable. This is a bug, never retried.
    #[error("Conflicting decision for {txn}: recorded {existing:?}, attempted {attempted:?}")]
    ConflictingDecision {
        txn: TxnId,
        existing: Box<DecisionRecord>,
        attempted: Box<DecisionRecord>,
    },

    /// A different participant list is already durable. This is a bug, never retried.
    #[error("Conflicting participant list for {0}")]
    ConflictingParticipantList(TxnId),

    #[error("No coordinator document for {0}")]
    NotFound(TxnId),

    #[error("Coordinator document for {0} has no decision")]
    NotDecided(TxnId),

    #[error("Log unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking storage task died; the write may or may not have landed
    #[error("Log task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Gave up on {what} for {txn} after {attempts} attempts: {source}")]
    RetriesExhausted {
        what: &'static str,
        txn: TxnId,
        attempts: u32,
        source: Box<LogError>,
    },
}

impl LogError {
    /// Invariant violations that must stop protocol progress
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::ConflictingDecision { .. } | LogError::ConflictingParticipantList(_)
        )
    }

    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LogError::Unavailable(_)
                | LogError::Storage(_)
                | LogError::Io(_)
                | LogError::Task(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        if self.is_fatal() {
            ErrorCode::InvariantViolation
        } else if matches!(self, LogError::RetriesExhausted { .. }) || self.is_transient() {
            ErrorCode::DecisionIndeterminate
        } else {
            ErrorCode::Internal
        }
    }
}
