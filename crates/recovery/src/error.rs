//! Error types for recovery

use shardtx_common::{ErrorCode, ParticipantId, TxnId};
use shardtx_log::LogError;
use shardtx_participant::{RecordId, ShardError};
use thiserror::Error;

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Recovery error types
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error("Coordinator is stepping down")]
    SteppingDown,

    #[error("{participant}: decision for {txn} without a prepare marker")]
    OrphanDecision {
        participant: ParticipantId,
        txn: TxnId,
    },

    #[error("{participant}: conflicting decisions for {txn}")]
    ConflictingDecision {
        participant: ParticipantId,
        txn: TxnId,
    },

    #[error("{participant}: {txn} was prepared twice")]
    DuplicatePrepare {
        participant: ParticipantId,
        txn: TxnId,
    },

    #[error(
        "{participant}: {txn} stages {record_id}, above the high-water mark {high_water_mark} at its prepare timestamp"
    )]
    RecordIdBeyondHighWaterMark {
        participant: ParticipantId,
        txn: TxnId,
        record_id: RecordId,
        high_water_mark: RecordId,
    },

    #[error("{participant}: {record_id} staged by {txn} for {key} is already used by {holder}")]
    SlotReuse {
        participant: ParticipantId,
        txn: TxnId,
        key: String,
        record_id: RecordId,
        holder: String,
    },
}

impl RecoveryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RecoveryError::Log(e) => e.code(),
            RecoveryError::Shard(e) => e.code(),
            RecoveryError::SteppingDown => ErrorCode::CoordinatorSteppingDown,
            _ => ErrorCode::InvariantViolation,
        }
    }

    /// Errors that mean durable state is inconsistent. Recovery must not
    /// continue past them.
    pub fn is_fatal(&self) -> bool {
        match self {
            RecoveryError::Log(e) => e.is_fatal(),
            RecoveryError::Shard(_) | RecoveryError::SteppingDown => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardtx_common::SessionId;

    #[test]
    fn test_history_errors_are_fatal() {
        let txn = TxnId::new(SessionId::new(), 1);
        let err = RecoveryError::SlotReuse {
            participant: "shard-a".into(),
            txn,
            key: "x".to_string(),
            record_id: RecordId(3),
            holder: "y".to_string(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::InvariantViolation);

        assert!(!RecoveryError::SteppingDown.is_fatal());
        assert_eq!(
            RecoveryError::SteppingDown.code(),
            ErrorCode::CoordinatorSteppingDown
        );
    }
}
