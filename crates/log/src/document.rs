//! Coordinator documents: the persisted form of one coordination
//!
//! Both log backends store the same document and share the transition rules
//! below, so write-once semantics do not depend on the backend.

use crate::error::{LogError, Result};
use serde::{Deserialize, Serialize};
use shardtx_clock::OpTime;
use shardtx_common::{DecisionRecord, ParticipantId, TxnId};

/// Durable record of one coordination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    pub txn: TxnId,

    /// Fixed once written
    pub participants: Vec<ParticipantId>,

    /// Written once; `None` while the decision is pending
    pub decision: Option<DecisionRecord>,

    /// Collectable once the majority commit point reaches this op time
    pub collectable_after: Option<OpTime>,
}

impl CoordinatorDocument {
    pub fn new(txn: TxnId, participants: Vec<ParticipantId>) -> Self {
        Self {
            txn,
            participants,
            decision: None,
            collectable_after: None,
        }
    }

    /// Serialize to bytes for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| LogError::Encoding(format!("Failed to encode document: {}", e)))?;
        Ok(bytes)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| LogError::Encoding(format!("Failed to decode document: {}", e)))
    }

    /// Participant list write. Returns the document to store, or `None` if the
    /// stored one already matches.
    pub(crate) fn with_participants(
        existing: Option<&CoordinatorDocument>,
        txn: TxnId,
        participants: &[ParticipantId],
    ) -> Result<Option<CoordinatorDocument>> {
        match existing {
            None => Ok(Some(CoordinatorDocument::new(txn, participants.to_vec()))),
            Some(doc) if doc.participants == participants => Ok(None),
            Some(_) => Err(LogError::ConflictingParticipantList(txn)),
        }
    }

    /// Decision write. Rewriting the same outcome is a no-op; a different
    /// outcome is an invariant violation.
    pub(crate) fn with_decision(
        existing: Option<&CoordinatorDocument>,
        txn: TxnId,
        decision: &DecisionRecord,
    ) -> Result<Option<CoordinatorDocument>> {
        let doc = existing.ok_or(LogError::NotFound(txn))?;

        match &doc.decision {
            None => {
                let mut updated = doc.clone();
                updated.decision = Some(decision.clone());
                Ok(Some(updated))
            }
            Some(recorded) if recorded.same_outcome(decision) => Ok(None),
            Some(recorded) => Err(LogError::ConflictingDecision {
                txn,
                existing: Box::new(recorded.clone()),
                attempted: Box::new(decision.clone()),
            }),
        }
    }

    /// Garbage collection scheduling. Only decided documents can be scheduled;
    /// an earlier schedule is never pulled forward.
    pub(crate) fn with_collectable_after(
        existing: Option<&CoordinatorDocument>,
        txn: TxnId,
        after: OpTime,
    ) -> Result<Option<CoordinatorDocument>> {
        let doc = existing.ok_or(LogError::NotFound(txn))?;
        if doc.decision.is_none() {
            return Err(LogError::NotDecided(txn));
        }

        match doc.collectable_after {
            Some(current) if current >= after => Ok(None),
            _ => {
                let mut updated = doc.clone();
                updated.collectable_after = Some(after);
                Ok(Some(updated))
            }
        }
    }

    /// True if the document can be deleted given the majority commit point
    pub fn is_collectable(&self, majority: OpTime) -> bool {
        self.decision.is_some() && self.collectable_after.is_some_and(|after| after <= majority)
    }
}
