//! Rebuilding a shard from its replication history
//!
//! The history is replayed in order. Prepares without a later decision stay
//! prepared: a shard never guesses an outcome, it waits for the coordinator
//! to deliver one or for the decision to show up in later history.
//!
//! Before a prepared transaction is reinstated its staged record ids are
//! checked against the storage high-water mark at the prepare timestamp and
//! against every slot already in use. New writes are only handed record ids
//! above anything the history has ever allocated.

use crate::error::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use shardtx_common::{ParticipantId, TxnId, TxnState};
use shardtx_participant::{
    DurableShardState, HighWaterMark, LocalShard, OplogEntry, PreparedTransaction, RecordId,
    RestoredShard, StoredDocument,
};
use std::collections::{BTreeMap, HashMap};

/// Summary of one shard reconstruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecoveryReport {
    pub participant: ParticipantId,
    /// Still prepared, waiting for a decision
    pub prepared: Vec<TxnId>,
    pub committed: usize,
    pub aborted: usize,
    /// First record id handed to new writes
    pub record_id_floor: RecordId,
}

/// Replays a shard's history into the state it is restored from
pub struct ParticipantRecovery {
    participant: ParticipantId,
    documents: BTreeMap<String, StoredDocument>,
    pending: BTreeMap<TxnId, PreparedTransaction>,
    resolved: HashMap<TxnId, TxnState>,
}

impl ParticipantRecovery {
    pub fn new(participant: impl Into<ParticipantId>) -> Self {
        Self {
            participant: participant.into(),
            documents: BTreeMap::new(),
            pending: BTreeMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Apply one history entry. A decision for an already resolved
    /// transaction is a no-op when it matches.
    pub fn apply(&mut self, entry: &OplogEntry) -> Result<()> {
        match entry {
            OplogEntry::Prepare {
                txn,
                prepare_timestamp,
                writes,
            } => {
                if self.pending.contains_key(txn) || self.resolved.contains_key(txn) {
                    return Err(RecoveryError::DuplicatePrepare {
                        participant: self.participant.clone(),
                        txn: *txn,
                    });
                }
                self.pending.insert(
                    *txn,
                    PreparedTransaction {
                        txn: *txn,
                        prepare_timestamp: *prepare_timestamp,
                        writes: writes.clone(),
                    },
                );
            }
            OplogEntry::Commit {
                txn,
                commit_timestamp,
            } => {
                if self.already(*txn, TxnState::Committed)? {
                    return Ok(());
                }
                let prepared = self.take_pending(*txn)?;
                for write in prepared.writes {
                    match (write.value, write.record_id) {
                        (Some(value), Some(record_id)) => {
                            self.documents.insert(
                                write.key,
                                StoredDocument {
                                    value,
                                    record_id,
                                    committed_at: *commit_timestamp,
                                },
                            );
                        }
                        _ => {
                            self.documents.remove(&write.key);
                        }
                    }
                }
                self.resolved.insert(*txn, TxnState::Committed);
            }
            OplogEntry::Abort { txn, .. } => {
                if self.already(*txn, TxnState::Aborted)? {
                    return Ok(());
                }
                self.take_pending(*txn)?;
                self.resolved.insert(*txn, TxnState::Aborted);
            }
        }
        Ok(())
    }

    /// True if `txn` is already resolved as `outcome`; an error if it was
    /// resolved the other way
    fn already(&self, txn: TxnId, outcome: TxnState) -> Result<bool> {
        match self.resolved.get(&txn) {
            Some(state) if *state == outcome => Ok(true),
            Some(_) => Err(RecoveryError::ConflictingDecision {
                participant: self.participant.clone(),
                txn,
            }),
            None => Ok(false),
        }
    }

    fn take_pending(&mut self, txn: TxnId) -> Result<PreparedTransaction> {
        self.pending
            .remove(&txn)
            .ok_or_else(|| RecoveryError::OrphanDecision {
                participant: self.participant.clone(),
                txn,
            })
    }

    /// Validate the surviving prepares and produce the restore state
    pub fn finish(
        self,
        durable: DurableShardState,
        high_water_mark: &dyn HighWaterMark,
    ) -> Result<(RestoredShard, ParticipantRecoveryReport)> {
        let participant = self.participant;

        let mut slots: HashMap<RecordId, String> = self
            .documents
            .iter()
            .map(|(key, doc)| (doc.record_id, key.clone()))
            .collect();
        let mut highest = slots.keys().copied().max().unwrap_or_default();

        for prepared in self.pending.values() {
            let limit = high_water_mark.high_water_mark(prepared.prepare_timestamp);

            for write in &prepared.writes {
                let Some(record_id) = write.record_id else {
                    continue;
                };
                if record_id > limit {
                    tracing::error!(
                        %participant,
                        txn = %prepared.txn,
                        %record_id,
                        high_water_mark = %limit,
                        "Prepared write beyond high-water mark"
                    );
                    return Err(RecoveryError::RecordIdBeyondHighWaterMark {
                        participant,
                        txn: prepared.txn,
                        record_id,
                        high_water_mark: limit,
                    });
                }

                match slots.get(&record_id) {
                    Some(holder) if *holder != write.key => {
                        tracing::error!(
                            %participant,
                            txn = %prepared.txn,
                            %record_id,
                            key = %write.key,
                            %holder,
                            "Prepared write slot reused"
                        );
                        return Err(RecoveryError::SlotReuse {
                            participant,
                            txn: prepared.txn,
                            key: write.key.clone(),
                            record_id,
                            holder: holder.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        slots.insert(record_id, write.key.clone());
                    }
                }
                highest = highest.max(record_id);
            }
        }

        let record_id_floor = high_water_mark.latest().max(highest).next();

        let mut resolved: Vec<(TxnId, TxnState)> = self.resolved.into_iter().collect();
        resolved.sort_by_key(|(txn, _)| *txn);
        let prepared: Vec<PreparedTransaction> = self.pending.into_values().collect();

        let report = ParticipantRecoveryReport {
            participant,
            prepared: prepared.iter().map(|p| p.txn).collect(),
            committed: count(&resolved, TxnState::Committed),
            aborted: count(&resolved, TxnState::Aborted),
            record_id_floor,
        };

        Ok((
            RestoredShard {
                documents: self.documents,
                prepared,
                resolved,
                durable,
                record_id_floor,
            },
            report,
        ))
    }
}

fn count(resolved: &[(TxnId, TxnState)], outcome: TxnState) -> usize {
    resolved.iter().filter(|(_, state)| *state == outcome).count()
}

/// Apply a decision seen in replication history after the shard was
/// restored. Returns false if it was already applied.
pub fn apply_observed(shard: &LocalShard, entry: &OplogEntry) -> Result<bool> {
    let txn = entry.txn();
    let orphan = || RecoveryError::OrphanDecision {
        participant: shard.id().clone(),
        txn,
    };
    let conflict = || RecoveryError::ConflictingDecision {
        participant: shard.id().clone(),
        txn,
    };

    match (entry, shard.txn_state(txn)) {
        (OplogEntry::Prepare { .. }, _) => Ok(false),

        (OplogEntry::Commit { .. }, Some(TxnState::Committed))
        | (OplogEntry::Abort { .. }, Some(TxnState::Aborted)) => Ok(false),

        (OplogEntry::Commit { .. }, Some(TxnState::Aborted))
        | (OplogEntry::Abort { .. }, Some(TxnState::Committed)) => Err(conflict()),

        (
            OplogEntry::Commit {
                commit_timestamp, ..
            },
            Some(TxnState::Prepared),
        ) => {
            shard.commit(txn, *commit_timestamp)?;
            tracing::info!(participant = %shard.id(), %txn, "Applied observed commit");
            Ok(true)
        }
        (OplogEntry::Abort { .. }, Some(TxnState::Prepared)) => {
            shard.abort(txn)?;
            tracing::info!(participant = %shard.id(), %txn, "Applied observed abort");
            Ok(true)
        }

        (_, Some(TxnState::InProgress)) | (_, None) => Err(orphan()),
    }
}
