//! Durable record of coordinator decisions
//!
//! The log holds one [`CoordinatorDocument`] per `(session, txnNumber)`. It is
//! the single source of truth for a coordination: the participant list is
//! written before any prepare is sent, the decision is written before any
//! participant hears about it, and both are write-once.

pub mod config;
pub mod document;
pub mod durable;
pub mod error;
pub mod gc;
pub mod memory;
pub mod retry;

pub use config::LogConfig;
pub use document::CoordinatorDocument;
pub use durable::FjallTransactionLog;
pub use error::{LogError, Result};
pub use gc::{GarbageCollector, MajorityCommitPoint};
pub use memory::MemoryTransactionLog;
pub use retry::persist_with_retry;

use async_trait::async_trait;
use shardtx_clock::OpTime;
use shardtx_common::{DecisionRecord, ParticipantId, TxnId};

/// Storage interface for coordinator documents
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Create the document with its participant list. Idempotent for the same
    /// list; a different list is a fatal conflict.
    async fn persist_participant_list(
        &self,
        txn: TxnId,
        participants: &[ParticipantId],
    ) -> Result<()>;

    /// Record the terminal decision. Idempotent for the same outcome; a
    /// different outcome is a fatal conflict.
    async fn persist_decision(&self, txn: TxnId, decision: &DecisionRecord) -> Result<()>;

    /// Allow deletion once the majority commit point reaches `after`
    async fn mark_garbage_collectable(&self, txn: TxnId, after: OpTime) -> Result<()>;

    async fn read(&self, txn: TxnId) -> Result<Option<CoordinatorDocument>>;

    async fn read_all(&self) -> Result<Vec<CoordinatorDocument>>;

    /// Delete every collectable document; returns the deleted ids
    async fn collect_garbage(&self, majority: OpTime) -> Result<Vec<TxnId>>;
}
