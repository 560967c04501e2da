//! Votes, decisions and abort reasons

use crate::{ErrorCode, ParticipantId, TxnNumber};
use serde::{Deserialize, Serialize};
use shardtx_clock::OpTime;
use std::fmt;

/// A participant's answer to `prepare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareVote {
    /// Writes are durable but invisible as of `prepare_timestamp`
    Commit { prepare_timestamp: OpTime },
    /// The participant cannot prepare
    Abort { reason: String },
}

/// Vote bookkeeping for one participant entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteState {
    Unvoted,
    PreparedYes,
    PreparedNo,
}

/// Outcome of two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitDecision {
    Commit,
    Abort,
}

impl fmt::Display for CommitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitDecision::Commit => f.write_str("commit"),
            CommitDecision::Abort => f.write_str("abort"),
        }
    }
}

/// Why a transaction was aborted.
///
/// Informational only: every variant is an ordinary abort as far as the
/// protocol is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// A participant voted to abort
    VotedNo {
        participant: ParticipantId,
        reason: String,
    },
    /// A participant did not vote before the vote deadline
    VoteTimeout { participant: ParticipantId },
    /// A participant could not be reached while the transaction was running
    ParticipantUnreachable { participant: ParticipantId },
    /// Sacrificed to relieve a saturated resource
    ResourcePressure { resource: String },
    /// Ran longer than the transaction lifetime limit
    LifetimeExpired,
    /// The client asked for the abort
    Explicit,
    /// A newer attempt started on the same session
    Superseded { by: TxnNumber },
    /// The session was killed before commit began
    SessionKilled,
    /// No durable decision existed when the coordinator recovered
    Recovery,
    /// An operation inside the transaction failed
    OperationFailed {
        participant: ParticipantId,
        reason: String,
    },
}

impl AbortReason {
    /// Code reported to clients for a transaction aborted for this reason.
    pub fn code(&self) -> ErrorCode {
        match self {
            AbortReason::ResourcePressure { .. } => ErrorCode::WriteConflict,
            _ => ErrorCode::NoSuchTransaction,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::VotedNo {
                participant,
                reason,
            } => write!(f, "participant {} voted to abort: {}", participant, reason),
            AbortReason::VoteTimeout { participant } => {
                write!(f, "participant {} did not vote in time", participant)
            }
            AbortReason::ParticipantUnreachable { participant } => {
                write!(f, "participant {} unreachable", participant)
            }
            AbortReason::ResourcePressure { resource } => {
                write!(f, "aborted to relieve pressure on {}", resource)
            }
            AbortReason::LifetimeExpired => f.write_str("transaction lifetime limit exceeded"),
            AbortReason::Explicit => f.write_str("aborted by client"),
            AbortReason::Superseded { by } => write!(f, "superseded by txnNumber {}", by),
            AbortReason::SessionKilled => f.write_str("session killed"),
            AbortReason::Recovery => f.write_str("no decision found during recovery"),
            AbortReason::OperationFailed {
                participant,
                reason,
            } => write!(f, "operation on {} failed: {}", participant, reason),
        }
    }
}

/// The durable terminal decision of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: CommitDecision,
    /// When the decision was made
    pub decision_time: OpTime,
    /// Set for commit decisions only
    pub commit_timestamp: Option<OpTime>,
    /// Set for abort decisions only
    pub abort_reason: Option<AbortReason>,
}

impl DecisionRecord {
    pub fn commit(commit_timestamp: OpTime, decision_time: OpTime) -> Self {
        Self {
            decision: CommitDecision::Commit,
            decision_time,
            commit_timestamp: Some(commit_timestamp),
            abort_reason: None,
        }
    }

    pub fn abort(reason: AbortReason, decision_time: OpTime) -> Self {
        Self {
            decision: CommitDecision::Abort,
            decision_time,
            commit_timestamp: None,
            abort_reason: Some(reason),
        }
    }

    pub fn is_commit(&self) -> bool {
        self.decision == CommitDecision::Commit
    }

    /// Two records describe the same outcome if they agree on the decision and,
    /// for commits, on the commit timestamp. Decision time and abort reason are
    /// informational.
    pub fn same_outcome(&self, other: &DecisionRecord) -> bool {
        self.decision == other.decision && self.commit_timestamp == other.commit_timestamp
    }
}
