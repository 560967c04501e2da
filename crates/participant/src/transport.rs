//! Delivering transactional requests to participants

use crate::error::TransportError;
use crate::operation::{OperationResult, ShardOperation};
use crate::shard::LocalShard;
use async_trait::async_trait;
use parking_lot::RwLock;
use shardtx_clock::OpTime;
use shardtx_common::{ParticipantId, PrepareVote, TxnId};
use std::collections::HashMap;
use std::sync::Arc;

/// RPC surface the coordinator uses to talk to participants.
///
/// Commit and abort must be safe to replay: a participant that already applied
/// the decision acknowledges again without side effects.
#[async_trait]
pub trait ParticipantTransport: Send + Sync {
    async fn send_operation(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        operation: ShardOperation,
    ) -> Result<OperationResult, TransportError>;

    async fn send_prepare(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
    ) -> Result<PrepareVote, TransportError>;

    async fn send_commit(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        commit_timestamp: OpTime,
    ) -> Result<(), TransportError>;

    async fn send_abort(&self, participant: &ParticipantId, txn: TxnId)
    -> Result<(), TransportError>;
}

/// Transport that calls [`LocalShard`]s in the same process
#[derive(Default)]
pub struct InProcessTransport {
    shards: RwLock<HashMap<ParticipantId, Arc<LocalShard>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard, replacing any shard with the same id. Returns the
    /// replaced shard.
    pub fn add_shard(&self, shard: Arc<LocalShard>) -> Option<Arc<LocalShard>> {
        self.shards.write().insert(shard.id().clone(), shard)
    }

    pub fn remove_shard(&self, id: &ParticipantId) -> Option<Arc<LocalShard>> {
        self.shards.write().remove(id)
    }

    pub fn shard(&self, id: &ParticipantId) -> Option<Arc<LocalShard>> {
        self.shards.read().get(id).cloned()
    }

    fn route(&self, participant: &ParticipantId) -> Result<Arc<LocalShard>, TransportError> {
        let shard = self
            .shard(participant)
            .ok_or_else(|| TransportError::UnknownParticipant(participant.clone()))?;

        if shard.faults().take_unreachable() {
            tracing::debug!(%participant, "Dropping request to unreachable participant");
            return Err(TransportError::Unreachable(participant.clone()));
        }
        Ok(shard)
    }
}

fn rejected(participant: &ParticipantId) -> impl FnOnce(crate::ShardError) -> TransportError + '_ {
    move |error| TransportError::Rejected {
        participant: participant.clone(),
        error,
    }
}

#[async_trait]
impl ParticipantTransport for InProcessTransport {
    async fn send_operation(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        operation: ShardOperation,
    ) -> Result<OperationResult, TransportError> {
        let shard = self.route(participant)?;
        shard.execute(txn, operation).map_err(rejected(participant))
    }

    async fn send_prepare(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
    ) -> Result<PrepareVote, TransportError> {
        let shard = self.route(participant)?;
        if let Some(delay) = shard.faults().prepare_delay() {
            tokio::time::sleep(delay).await;
        }
        shard.prepare(txn).map_err(rejected(participant))
    }

    async fn send_commit(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        commit_timestamp: OpTime,
    ) -> Result<(), TransportError> {
        let shard = self.route(participant)?;
        shard
            .commit(txn, commit_timestamp)
            .map_err(rejected(participant))
    }

    async fn send_abort(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
    ) -> Result<(), TransportError> {
        let shard = self.route(participant)?;
        shard.abort(txn).map_err(rejected(participant))
    }
}
