//! Replication history and record-id bookkeeping
//!
//! Every prepared transaction leaves a `Prepare` marker carrying its staged
//! writes and the record ids they occupy; its outcome is a later `Commit` or
//! `Abort` marker. Together with the [`RecordIdHistory`] this is the durable
//! state a shard is rebuilt from after a restart.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardtx_clock::OpTime;
use shardtx_common::TxnId;
use std::collections::BTreeMap;
use std::fmt;

/// Physical slot of a document in a shard's storage
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn next(&self) -> Self {
        RecordId(self.0 + 1)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

/// One buffered write of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedWrite {
    pub key: String,
    /// `None` deletes the document
    pub value: Option<Value>,
    /// Slot the document occupies once committed
    pub record_id: Option<RecordId>,
}

/// Entry in a shard's replication history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OplogEntry {
    Prepare {
        txn: TxnId,
        prepare_timestamp: OpTime,
        writes: Vec<StagedWrite>,
    },
    Commit {
        txn: TxnId,
        commit_timestamp: OpTime,
    },
    Abort {
        txn: TxnId,
        at: OpTime,
    },
}

impl OplogEntry {
    pub fn txn(&self) -> TxnId {
        match self {
            OplogEntry::Prepare { txn, .. }
            | OplogEntry::Commit { txn, .. }
            | OplogEntry::Abort { txn, .. } => *txn,
        }
    }
}

/// Storage-layer query used when reconstructing prepared transactions
pub trait HighWaterMark: Send + Sync {
    /// Highest record id allocated at or before `snapshot`
    fn high_water_mark(&self, snapshot: OpTime) -> RecordId;

    /// Highest record id ever allocated
    fn latest(&self) -> RecordId;
}

/// When each record id was allocated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdHistory {
    allocations: BTreeMap<OpTime, RecordId>,
}

impl RecordIdHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: OpTime, id: RecordId) {
        let entry = self.allocations.entry(at).or_default();
        *entry = (*entry).max(id);
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

impl HighWaterMark for RecordIdHistory {
    fn high_water_mark(&self, snapshot: OpTime) -> RecordId {
        self.allocations
            .range(..=snapshot)
            .map(|(_, id)| *id)
            .max()
            .unwrap_or_default()
    }

    fn latest(&self) -> RecordId {
        self.allocations.values().copied().max().unwrap_or_default()
    }
}

/// What survives a shard restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableShardState {
    pub oplog: Vec<OplogEntry>,
    pub record_ids: RecordIdHistory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_water_mark_at_snapshot() {
        let mut history = RecordIdHistory::new();
        history.record(OpTime::new(10, 0), RecordId(1));
        history.record(OpTime::new(20, 0), RecordId(2));
        history.record(OpTime::new(30, 0), RecordId(3));

        assert_eq!(history.high_water_mark(OpTime::new(5, 0)), RecordId(0));
        assert_eq!(history.high_water_mark(OpTime::new(20, 0)), RecordId(2));
        assert_eq!(history.high_water_mark(OpTime::new(25, 0)), RecordId(2));
        assert_eq!(history.latest(), RecordId(3));
    }
}
