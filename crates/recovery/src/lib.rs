//! Recovery after a restart or failover
//!
//! Two halves. On the coordinator side the transaction log is read back and
//! every coordination that had not finished is handed to the transaction
//! service again: documents with a decision are delivered again, documents
//! without one are decided abort. On the participant side a shard's
//! replication history is replayed to rebuild its documents and reinstate
//! its prepared transactions, which stay prepared until a decision arrives.

pub mod coordinator;
pub mod error;
pub mod participant;

pub use coordinator::CoordinatorRecoveryReport;
pub use error::{RecoveryError, Result};
pub use participant::{ParticipantRecovery, ParticipantRecoveryReport, apply_observed};

use shardtx_clock::SharedClock;
use shardtx_common::ParticipantId;
use shardtx_coordinator::TransactionCoordinatorService;
use shardtx_participant::{DurableShardState, HighWaterMark, LocalShard};

/// Rebuilds in-memory coordinator and participant state from durable state
pub struct RecoveryReconstructor {
    clock: SharedClock,
}

impl RecoveryReconstructor {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Resume every unfinished coordination found in `service`'s log.
    ///
    /// Returns once the coordinators are running; use
    /// [`TransactionCoordinatorService::wait_for_coordinators`] to wait for
    /// them to finish.
    pub async fn recover_coordinator(
        &self,
        service: &TransactionCoordinatorService,
    ) -> Result<CoordinatorRecoveryReport> {
        coordinator::recover(service).await
    }

    /// Rebuild a shard from what survived its restart, using its own record
    /// id history as the storage high-water mark
    pub fn reconstruct_participant(
        &self,
        participant: impl Into<ParticipantId>,
        durable: DurableShardState,
    ) -> Result<(LocalShard, ParticipantRecoveryReport)> {
        let record_ids = durable.record_ids.clone();
        self.reconstruct_participant_with(participant, durable, &record_ids)
    }

    /// Rebuild a shard, checking prepared writes against `high_water_mark`
    pub fn reconstruct_participant_with(
        &self,
        participant: impl Into<ParticipantId>,
        durable: DurableShardState,
        high_water_mark: &dyn HighWaterMark,
    ) -> Result<(LocalShard, ParticipantRecoveryReport)> {
        let participant = participant.into();

        let mut recovery = ParticipantRecovery::new(participant.clone());
        for entry in &durable.oplog {
            recovery.apply(entry)?;
        }
        let (restored, report) = recovery.finish(durable, high_water_mark)?;

        tracing::info!(
            %participant,
            prepared = report.prepared.len(),
            committed = report.committed,
            aborted = report.aborted,
            record_id_floor = %report.record_id_floor,
            "Reconstructed participant"
        );
        for txn in &report.prepared {
            tracing::info!(%participant, %txn, "Transaction left prepared until a decision arrives");
        }

        let shard = LocalShard::restore(participant, self.clock.clone(), restored);
        Ok((shard, report))
    }
}
