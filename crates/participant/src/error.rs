//! Error types for shard participants

use shardtx_clock::OpTime;
use shardtx_common::{ErrorCode, ParticipantId, TxnId, TxnNumber};
use thiserror::Error;

/// Result type for shard operations
pub type Result<T> = std::result::Result<T, ShardError>;

/// Errors returned by a shard for a transactional request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("No such transaction {0}")]
    NoSuchTransaction(TxnId),

    #[error("Transaction {0} already committed")]
    TransactionCommitted(TxnId),

    #[error("Transaction {0} is prepared")]
    PreparedTransactionInProgress(TxnId),

    #[error("txnNumber of {txn} is older than active txnNumber {active}")]
    TransactionNumberTooOld { txn: TxnId, active: TxnNumber },

    #[error("Duplicate key {0}")]
    DuplicateKey(String),

    #[error("Key {key} is locked by {holder}")]
    WriteConflict { key: String, holder: TxnId },

    #[error("Transaction {0} must be prepared before it can commit")]
    NotPrepared(TxnId),

    #[error("Commit timestamp {commit} for {txn} is earlier than prepare timestamp {prepare}")]
    CommitBeforePrepare {
        txn: TxnId,
        commit: OpTime,
        prepare: OpTime,
    },
}

impl ShardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ShardError::NoSuchTransaction(_) => ErrorCode::NoSuchTransaction,
            ShardError::TransactionCommitted(_) => ErrorCode::TransactionCommitted,
            ShardError::PreparedTransactionInProgress(_) => {
                ErrorCode::PreparedTransactionInProgress
            }
            ShardError::TransactionNumberTooOld { .. } => ErrorCode::TransactionNumberTooOld,
            ShardError::DuplicateKey(_) => ErrorCode::DuplicateKey,
            ShardError::WriteConflict { .. } => ErrorCode::WriteConflict,
            ShardError::NotPrepared(_) | ShardError::CommitBeforePrepare { .. } => {
                ErrorCode::InvariantViolation
            }
        }
    }
}

/// Errors delivering a request to a participant
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Participant {0} is unreachable")]
    Unreachable(ParticipantId),

    #[error("Unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Participant {participant} rejected the request: {error}")]
    Rejected {
        participant: ParticipantId,
        error: ShardError,
    },
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Unreachable(_) | TransportError::UnknownParticipant(_) => {
                ErrorCode::ParticipantUnreachable
            }
            TransportError::Rejected { error, .. } => error.code(),
        }
    }

    /// The participant has no live record of the transaction
    pub fn is_no_such_transaction(&self) -> bool {
        self.code() == ErrorCode::NoSuchTransaction
    }
}
