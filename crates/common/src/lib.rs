//! Common types for shardtx
//!
//! This crate defines:
//! - Session and transaction identifiers
//! - Votes, decisions and abort reasons exchanged by coordinator and participants
//! - Protocol error codes
//! - Cooperative interruption tokens and retry backoff

mod backoff;
mod decision;
mod error_code;
mod interrupt;
mod session_id;
mod txn;

pub use backoff::{Backoff, RetryPolicy};
pub use decision::{AbortReason, CommitDecision, DecisionRecord, PrepareVote, VoteState};
pub use error_code::ErrorCode;
pub use interrupt::{Interrupt, Interrupted};
pub use session_id::SessionId;
pub use txn::{ParticipantId, TxnId, TxnNumber, TxnState};

pub use shardtx_clock::OpTime;
