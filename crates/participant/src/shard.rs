//! In-process shard participant
//!
//! Holds committed documents plus one local record per transaction it has
//! seen. Commit and abort are idempotent: a replayed decision is recognised
//! from the local record and never applied twice.

use crate::error::{Result, ShardError};
use crate::lock::{LockAttemptResult, LockManager};
use crate::operation::{OperationResult, ShardOperation};
use crate::oplog::{
    DurableShardState, HighWaterMark, OplogEntry, RecordId, RecordIdHistory, StagedWrite,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardtx_clock::{OpTime, SharedClock};
use shardtx_common::{ParticipantId, PrepareVote, SessionId, TxnId, TxnNumber, TxnState};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// A committed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub value: Value,
    pub record_id: RecordId,
    pub committed_at: OpTime,
}

/// A prepared transaction handed to [`LocalShard::restore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub txn: TxnId,
    pub prepare_timestamp: OpTime,
    pub writes: Vec<StagedWrite>,
}

/// State a shard is rebuilt from after a restart
#[derive(Debug, Clone, Default)]
pub struct RestoredShard {
    pub documents: BTreeMap<String, StoredDocument>,
    pub prepared: Vec<PreparedTransaction>,
    /// Transactions whose outcome is already applied
    pub resolved: Vec<(TxnId, TxnState)>,
    pub durable: DurableShardState,
    /// First record id new writes may use
    pub record_id_floor: RecordId,
}

/// Requests received, including replays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub operations: u64,
    pub prepares: u64,
    pub commits: u64,
    pub aborts: u64,
}

/// Fault injection for tests and demos
#[derive(Debug, Default)]
pub struct ShardFaults {
    vote_no: Mutex<Option<String>>,
    prepare_delay: Mutex<Option<Duration>>,
    unreachable: AtomicBool,
    failing_requests: AtomicU32,
}

impl ShardFaults {
    /// Answer every prepare with a no vote
    pub fn vote_no(&self, reason: impl Into<String>) {
        *self.vote_no.lock() = Some(reason.into());
    }

    pub fn clear_vote_no(&self) {
        *self.vote_no.lock() = None;
    }

    /// Hold every prepare response for `delay`
    pub fn delay_prepare(&self, delay: Duration) {
        *self.prepare_delay.lock() = Some(delay);
    }

    pub fn clear_prepare_delay(&self) {
        *self.prepare_delay.lock() = None;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make the next `n` requests fail as unreachable
    pub fn fail_next_requests(&self, n: u32) {
        self.failing_requests.store(n, Ordering::SeqCst);
    }

    pub(crate) fn prepare_delay(&self) -> Option<Duration> {
        *self.prepare_delay.lock()
    }

    /// Consume one injected failure, if any
    pub(crate) fn take_unreachable(&self) -> bool {
        if self.unreachable.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn vote_no_reason(&self) -> Option<String> {
        self.vote_no.lock().clone()
    }
}

#[derive(Debug, Clone)]
struct LocalTxn {
    state: TxnState,
    writes: BTreeMap<String, StagedWrite>,
    prepare_timestamp: Option<OpTime>,
}

impl LocalTxn {
    fn new() -> Self {
        Self {
            state: TxnState::InProgress,
            writes: BTreeMap::new(),
            prepare_timestamp: None,
        }
    }
}

struct ShardState {
    documents: BTreeMap<String, StoredDocument>,
    transactions: HashMap<TxnId, LocalTxn>,
    /// Highest txnNumber seen per session
    active: HashMap<SessionId, TxnNumber>,
    locks: LockManager,
    oplog: Vec<OplogEntry>,
    record_ids: RecordIdHistory,
    next_record_id: RecordId,
    /// Times each transaction's commit was applied to the documents
    applied: HashMap<TxnId, u32>,
    messages: MessageCounts,
}

impl ShardState {
    fn empty() -> Self {
        Self {
            documents: BTreeMap::new(),
            transactions: HashMap::new(),
            active: HashMap::new(),
            locks: LockManager::default(),
            oplog: Vec::new(),
            record_ids: RecordIdHistory::new(),
            next_record_id: RecordId(1),
            applied: HashMap::new(),
            messages: MessageCounts::default(),
        }
    }

    fn allocate_record_id(&mut self, at: OpTime) -> RecordId {
        let id = self.next_record_id;
        self.next_record_id = id.next();
        self.record_ids.record(at, id);
        id
    }

    /// Find or open the local record for `txn`, superseding an older
    /// in-progress attempt on the same session.
    fn open_transaction(&mut self, txn: TxnId, at: OpTime) -> Result<()> {
        if let Some(&active) = self.active.get(&txn.session_id)
            && txn.txn_number < active
        {
            return Err(ShardError::TransactionNumberTooOld { txn, active });
        }

        if let Some(local) = self.transactions.get(&txn) {
            return match local.state {
                TxnState::InProgress => Ok(()),
                TxnState::Prepared => Err(ShardError::PreparedTransactionInProgress(txn)),
                TxnState::Committed => Err(ShardError::TransactionCommitted(txn)),
                TxnState::Aborted => Err(ShardError::NoSuchTransaction(txn)),
            };
        }

        if let Some(&active) = self.active.get(&txn.session_id) {
            let older = TxnId::new(txn.session_id, active);
            match self.transactions.get(&older).map(|local| local.state) {
                Some(TxnState::Prepared) => {
                    return Err(ShardError::PreparedTransactionInProgress(older));
                }
                Some(TxnState::InProgress) => self.abort_local(older, at),
                _ => {}
            }
        }

        self.transactions.insert(txn, LocalTxn::new());
        self.active.insert(txn.session_id, txn.txn_number);
        Ok(())
    }

    /// Remember an abort that arrived before any operation of `txn`, so an
    /// operation delayed in flight cannot reopen it.
    fn tombstone(&mut self, txn: TxnId, at: OpTime) {
        if let Some(&active) = self.active.get(&txn.session_id) {
            if txn.txn_number < active {
                return;
            }
            let older = TxnId::new(txn.session_id, active);
            if self.transactions.get(&older).map(|local| local.state) == Some(TxnState::InProgress)
            {
                self.abort_local(older, at);
            }
        }

        let mut local = LocalTxn::new();
        local.state = TxnState::Aborted;
        self.transactions.insert(txn, local);
        self.active.insert(txn.session_id, txn.txn_number);
    }

    /// Value of `key` as seen by `txn`: its own writes first, then committed data
    fn visible(&self, txn: TxnId, key: &str) -> Option<Value> {
        match self
            .transactions
            .get(&txn)
            .and_then(|local| local.writes.get(key))
        {
            Some(staged) => staged.value.clone(),
            None => self.documents.get(key).map(|doc| doc.value.clone()),
        }
    }

    fn slot_for(&self, txn: TxnId, key: &str) -> Option<RecordId> {
        self.transactions
            .get(&txn)
            .and_then(|local| local.writes.get(key))
            .and_then(|staged| staged.record_id)
            .or_else(|| self.documents.get(key).map(|doc| doc.record_id))
    }

    fn lock(&mut self, txn: TxnId, key: &str) -> Result<()> {
        match self.locks.check(txn, key) {
            LockAttemptResult::WouldGrant => {
                self.locks.grant(txn, key.to_string());
                Ok(())
            }
            LockAttemptResult::Conflict { holder } => Err(ShardError::WriteConflict {
                key: key.to_string(),
                holder,
            }),
        }
    }

    fn stage(&mut self, txn: TxnId, write: StagedWrite) {
        if let Some(local) = self.transactions.get_mut(&txn) {
            local.writes.insert(write.key.clone(), write);
        }
    }

    fn apply_operation(
        &mut self,
        txn: TxnId,
        operation: ShardOperation,
        at: OpTime,
    ) -> Result<OperationResult> {
        match operation {
            ShardOperation::Get { key } => {
                let value = self.visible(txn, &key);
                Ok(OperationResult::Get { key, value })
            }
            ShardOperation::Insert { key, value } => {
                self.lock(txn, &key)?;
                if self.visible(txn, &key).is_some() {
                    return Err(ShardError::DuplicateKey(key));
                }
                let record_id = match self.slot_for(txn, &key) {
                    Some(id) => id,
                    None => self.allocate_record_id(at),
                };
                self.stage(
                    txn,
                    StagedWrite {
                        key: key.clone(),
                        value: Some(value),
                        record_id: Some(record_id),
                    },
                );
                Ok(OperationResult::Inserted { key })
            }
            ShardOperation::Put { key, value } => {
                self.lock(txn, &key)?;
                let previous = self.visible(txn, &key);
                let record_id = match self.slot_for(txn, &key) {
                    Some(id) => id,
                    None => self.allocate_record_id(at),
                };
                self.stage(
                    txn,
                    StagedWrite {
                        key: key.clone(),
                        value: Some(value),
                        record_id: Some(record_id),
                    },
                );
                Ok(OperationResult::Put { key, previous })
            }
            ShardOperation::Delete { key } => {
                self.lock(txn, &key)?;
                let deleted = self.visible(txn, &key).is_some();
                if deleted {
                    let record_id = self.slot_for(txn, &key);
                    self.stage(
                        txn,
                        StagedWrite {
                            key: key.clone(),
                            value: None,
                            record_id,
                        },
                    );
                }
                Ok(OperationResult::Deleted { key, deleted })
            }
        }
    }

    fn prepare_local(&mut self, txn: TxnId, at: OpTime) {
        let Some(local) = self.transactions.get_mut(&txn) else {
            return;
        };
        local.state = TxnState::Prepared;
        local.prepare_timestamp = Some(at);
        let writes = local.writes.values().cloned().collect();

        self.oplog.push(OplogEntry::Prepare {
            txn,
            prepare_timestamp: at,
            writes,
        });
    }

    fn abort_local(&mut self, txn: TxnId, at: OpTime) {
        let Some(local) = self.transactions.get_mut(&txn) else {
            return;
        };
        if local.state == TxnState::Prepared {
            self.oplog.push(OplogEntry::Abort { txn, at });
        }
        local.state = TxnState::Aborted;
        local.writes.clear();
        self.locks.release_all(txn);
    }

    fn apply_commit(&mut self, txn: TxnId, commit_timestamp: OpTime) {
        let Some(local) = self.transactions.get_mut(&txn) else {
            return;
        };
        let writes = std::mem::take(&mut local.writes);
        local.state = TxnState::Committed;

        for (key, write) in writes {
            match (write.value, write.record_id) {
                (Some(value), Some(record_id)) => {
                    self.documents.insert(
                        key,
                        StoredDocument {
                            value,
                            record_id,
                            committed_at: commit_timestamp,
                        },
                    );
                }
                _ => {
                    self.documents.remove(&key);
                }
            }
        }

        self.locks.release_all(txn);
        self.oplog.push(OplogEntry::Commit {
            txn,
            commit_timestamp,
        });
        *self.applied.entry(txn).or_default() += 1;
    }
}

/// A shard taking part in distributed transactions
pub struct LocalShard {
    id: ParticipantId,
    clock: SharedClock,
    state: Mutex<ShardState>,
    faults: ShardFaults,
}

impl LocalShard {
    pub fn new(id: impl Into<ParticipantId>, clock: SharedClock) -> Self {
        Self {
            id: id.into(),
            clock,
            state: Mutex::new(ShardState::empty()),
            faults: ShardFaults::default(),
        }
    }

    /// Rebuild a shard from reconstructed state. Prepared transactions get
    /// their locks back and stay prepared until a decision arrives.
    pub fn restore(
        id: impl Into<ParticipantId>,
        clock: SharedClock,
        restored: RestoredShard,
    ) -> Self {
        let mut state = ShardState::empty();
        state.documents = restored.documents;
        state.oplog = restored.durable.oplog;
        state.record_ids = restored.durable.record_ids;
        state.next_record_id = restored.record_id_floor.max(RecordId(1));

        let mut latest = OpTime::NULL;
        for (txn, outcome) in restored.resolved {
            state.transactions.insert(
                txn,
                LocalTxn {
                    state: outcome,
                    writes: BTreeMap::new(),
                    prepare_timestamp: None,
                },
            );
            if outcome == TxnState::Committed {
                state.applied.insert(txn, 1);
            }
            note_active(&mut state.active, txn);
        }

        for prepared in restored.prepared {
            let txn = prepared.txn;
            latest = latest.max(prepared.prepare_timestamp);
            for write in &prepared.writes {
                state.locks.grant(txn, write.key.clone());
            }
            state.transactions.insert(
                txn,
                LocalTxn {
                    state: TxnState::Prepared,
                    writes: prepared
                        .writes
                        .into_iter()
                        .map(|write| (write.key.clone(), write))
                        .collect(),
                    prepare_timestamp: Some(prepared.prepare_timestamp),
                },
            );
            note_active(&mut state.active, txn);
        }

        for entry in &state.oplog {
            latest = latest.max(match entry {
                OplogEntry::Prepare {
                    prepare_timestamp, ..
                } => *prepare_timestamp,
                OplogEntry::Commit {
                    commit_timestamp, ..
                } => *commit_timestamp,
                OplogEntry::Abort { at, .. } => *at,
            });
        }
        clock.advance(latest);

        Self {
            id: id.into(),
            clock,
            state: Mutex::new(state),
            faults: ShardFaults::default(),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn faults(&self) -> &ShardFaults {
        &self.faults
    }

    /// Run one operation inside `txn`. A failed write aborts the transaction
    /// on this shard.
    pub fn execute(&self, txn: TxnId, operation: ShardOperation) -> Result<OperationResult> {
        let at = self.clock.now();
        let mut state = self.state.lock();
        state.messages.operations += 1;
        state.open_transaction(txn, at)?;

        let result = state.apply_operation(txn, operation, at);
        if let Err(e) = &result {
            tracing::debug!(shard = %self.id, %txn, "Operation failed, aborting locally: {}", e);
            state.abort_local(txn, at);
        }
        result
    }

    /// Durably record readiness to commit and vote
    pub fn prepare(&self, txn: TxnId) -> Result<PrepareVote> {
        let at = self.clock.now();
        let mut state = self.state.lock();
        state.messages.prepares += 1;

        let (current, prepared_at) = state
            .transactions
            .get(&txn)
            .map(|local| (local.state, local.prepare_timestamp))
            .ok_or(ShardError::NoSuchTransaction(txn))?;

        match current {
            TxnState::Prepared => Ok(PrepareVote::Commit {
                prepare_timestamp: prepared_at.unwrap_or(at),
            }),
            TxnState::Committed => Err(ShardError::TransactionCommitted(txn)),
            TxnState::Aborted => Err(ShardError::NoSuchTransaction(txn)),
            TxnState::InProgress => {
                if let Some(reason) = self.faults.vote_no_reason() {
                    tracing::debug!(shard = %self.id, %txn, "Voting to abort: {}", reason);
                    state.abort_local(txn, at);
                    return Ok(PrepareVote::Abort { reason });
                }

                state.prepare_local(txn, at);
                tracing::debug!(shard = %self.id, %txn, prepare_timestamp = %at, "Prepared");
                Ok(PrepareVote::Commit {
                    prepare_timestamp: at,
                })
            }
        }
    }

    /// Apply a commit decision. Replays of an applied commit are no-ops.
    pub fn commit(&self, txn: TxnId, commit_timestamp: OpTime) -> Result<()> {
        self.clock.advance(commit_timestamp);
        let mut state = self.state.lock();
        state.messages.commits += 1;

        let (current, prepared_at) = state
            .transactions
            .get(&txn)
            .map(|local| (local.state, local.prepare_timestamp))
            .ok_or(ShardError::NoSuchTransaction(txn))?;

        match current {
            TxnState::Committed => {
                tracing::debug!(shard = %self.id, %txn, "Commit already applied");
                Ok(())
            }
            TxnState::Aborted => Err(ShardError::NoSuchTransaction(txn)),
            TxnState::InProgress => Err(ShardError::NotPrepared(txn)),
            TxnState::Prepared => {
                if let Some(prepare) = prepared_at
                    && commit_timestamp < prepare
                {
                    return Err(ShardError::CommitBeforePrepare {
                        txn,
                        commit: commit_timestamp,
                        prepare,
                    });
                }
                state.apply_commit(txn, commit_timestamp);
                tracing::debug!(shard = %self.id, %txn, %commit_timestamp, "Committed");
                Ok(())
            }
        }
    }

    /// Apply an abort decision. Replays of an applied abort are no-ops.
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        let at = self.clock.now();
        let mut state = self.state.lock();
        state.messages.aborts += 1;

        let Some(current) = state.transactions.get(&txn).map(|local| local.state) else {
            state.tombstone(txn, at);
            return Err(ShardError::NoSuchTransaction(txn));
        };

        match current {
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(ShardError::TransactionCommitted(txn)),
            TxnState::InProgress | TxnState::Prepared => {
                state.abort_local(txn, at);
                tracing::debug!(shard = %self.id, %txn, "Aborted");
                Ok(())
            }
        }
    }

    /// Committed value of `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().documents.get(key).map(|doc| doc.value.clone())
    }

    pub fn document(&self, key: &str) -> Option<StoredDocument> {
        self.state.lock().documents.get(key).cloned()
    }

    pub fn documents(&self) -> BTreeMap<String, StoredDocument> {
        self.state.lock().documents.clone()
    }

    pub fn txn_state(&self, txn: TxnId) -> Option<TxnState> {
        self.state.lock().transactions.get(&txn).map(|local| local.state)
    }

    pub fn prepare_timestamp(&self, txn: TxnId) -> Option<OpTime> {
        self.state
            .lock()
            .transactions
            .get(&txn)
            .and_then(|local| local.prepare_timestamp)
    }

    /// Transactions prepared and awaiting a decision
    pub fn prepared_transactions(&self) -> Vec<TxnId> {
        let mut txns: Vec<TxnId> = self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|(_, local)| local.state == TxnState::Prepared)
            .map(|(txn, _)| *txn)
            .collect();
        txns.sort();
        txns
    }

    /// How many times the commit of `txn` changed this shard's documents
    pub fn applied_count(&self, txn: TxnId) -> u32 {
        self.state.lock().applied.get(&txn).copied().unwrap_or(0)
    }

    pub fn messages(&self) -> MessageCounts {
        self.state.lock().messages
    }

    pub fn locks_held_by(&self, txn: TxnId) -> Vec<String> {
        self.state.lock().locks.locks_held_by(txn)
    }

    pub fn next_record_id(&self) -> RecordId {
        self.state.lock().next_record_id
    }

    pub fn oplog(&self) -> Vec<OplogEntry> {
        self.state.lock().oplog.clone()
    }

    /// Snapshot of what would survive a restart
    pub fn durable_state(&self) -> DurableShardState {
        let state = self.state.lock();
        DurableShardState {
            oplog: state.oplog.clone(),
            record_ids: state.record_ids.clone(),
        }
    }
}

fn note_active(active: &mut HashMap<SessionId, TxnNumber>, txn: TxnId) {
    let entry = active.entry(txn.session_id).or_insert(txn.txn_number);
    *entry = (*entry).max(txn.txn_number);
}

impl HighWaterMark for LocalShard {
    fn high_water_mark(&self, snapshot: OpTime) -> RecordId {
        self.state.lock().record_ids.high_water_mark(snapshot)
    }

    fn latest(&self) -> RecordId {
        self.state.lock().record_ids.latest()
    }
}

impl std::fmt::Debug for LocalShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalShard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardtx_clock::OpTimeClock;
    use std::sync::Arc;

    fn shard() -> LocalShard {
        LocalShard::new("shard-a", Arc::new(OpTimeClock::new()))
    }

    fn put(key: &str, value: Value) -> ShardOperation {
        ShardOperation::Put {
            key: key.to_string(),
            value,
        }
    }

    fn prepared_at(vote: PrepareVote) -> OpTime {
        match vote {
            PrepareVote::Commit { prepare_timestamp } => prepare_timestamp,
            PrepareVote::Abort { reason } => panic!("unexpected no vote: {}", reason),
        }
    }

    #[test]
    fn test_commit_applies_once() {
        let shard = shard();
        let txn = TxnId::new(SessionId::new(), 1);

        shard.execute(txn, put("x", json!(1))).unwrap();
        let ts = prepared_at(shard.prepare(txn).unwrap());
        assert_eq!(shard.get("x"), None);

        shard.commit(txn, ts).unwrap();
        shard.commit(txn, ts).unwrap();

        assert_eq!(shard.get("x"), Some(json!(1)));
        assert_eq!(shard.applied_count(txn), 1);
        assert_eq!(shard.messages().commits, 2);
        assert!(shard.locks_held_by(txn).is_empty());
    }

    #[test]
    fn test_abort_is_idempotent_and_discards_writes() {
        let shard = shard();
        let txn = TxnId::new(SessionId::new(), 1);

        shard.execute(txn, put("x", json!(1))).unwrap();
        shard.prepare(txn).unwrap();
        shard.abort(txn).unwrap();
        shard.abort(txn).unwrap();

        assert_eq!(shard.get("x"), None);
        assert_eq!(shard.txn_state(txn), Some(TxnState::Aborted));
        assert_eq!(
            shard.commit(txn, OpTime::new(1, 0)),
            Err(ShardError::NoSuchTransaction(txn))
        );

        let markers: Vec<_> = shard
            .oplog()
            .into_iter()
            .filter(|e| matches!(e, OplogEntry::Abort { .. }))
            .collect();
        assert_eq!(markers.len(), 1);
    }

    #[test]
    fn test_duplicate_key_aborts_only_that_transaction() {
        let shard = shard();
        let session = SessionId::new();
        let setup = TxnId::new(session, 1);
        shard
            .execute(
                setup,
                ShardOperation::Insert {
                    key: "x".into(),
                    value: json!("first"),
                },
            )
            .unwrap();
        let ts = prepared_at(shard.prepare(setup).unwrap());
        shard.commit(setup, ts).unwrap();

        let txn = TxnId::new(session, 2);
        let err = shard
            .execute(
                txn,
                ShardOperation::Insert {
                    key: "x".into(),
                    value: json!("second"),
                },
            )
            .unwrap_err();
        assert_eq!(err, ShardError::DuplicateKey("x".into()));
        assert_eq!(shard.txn_state(txn), Some(TxnState::Aborted));

        let other = TxnId::new(SessionId::new(), 1);
        shard.execute(other, put("y", json!(2))).unwrap();
        assert_eq!(shard.txn_state(other), Some(TxnState::InProgress));
    }

    #[test]
    fn test_write_conflict_between_open_transactions() {
        let shard = shard();
        let t1 = TxnId::new(SessionId::new(), 1);
        let t2 = TxnId::new(SessionId::new(), 1);

        shard.execute(t1, put("x", json!(1))).unwrap();
        let err = shard.execute(t2, put("x", json!(2))).unwrap_err();
        assert_eq!(
            err,
            ShardError::WriteConflict {
                key: "x".into(),
                holder: t1
            }
        );
    }

    #[test]
    fn test_session_rules() {
        let shard = shard();
        let session = SessionId::new();
        let t1 = TxnId::new(session, 1);
        let t2 = TxnId::new(session, 2);
        let t3 = TxnId::new(session, 3);

        shard.execute(t1, put("a", json!(1))).unwrap();
        // A newer attempt supersedes the in-progress one
        shard.execute(t2, put("b", json!(2))).unwrap();
        assert_eq!(shard.txn_state(t1), Some(TxnState::Aborted));
        assert!(matches!(
            shard.execute(t1, put("a", json!(1))),
            Err(ShardError::TransactionNumberTooOld { .. })
        ));

        shard.prepare(t2).unwrap();
        assert_eq!(
            shard.execute(t2, put("c", json!(3))),
            Err(ShardError::PreparedTransactionInProgress(t2))
        );
        assert_eq!(
            shard.execute(t3, put("c", json!(3))),
            Err(ShardError::PreparedTransactionInProgress(t2))
        );
    }

    #[test]
    fn test_vote_no_fault() {
        let shard = shard();
        let txn = TxnId::new(SessionId::new(), 1);
        shard.execute(txn, put("x", json!(1))).unwrap();

        shard.faults().vote_no("disk full");
        assert_eq!(
            shard.prepare(txn).unwrap(),
            PrepareVote::Abort {
                reason: "disk full".into()
            }
        );
        assert_eq!(shard.txn_state(txn), Some(TxnState::Aborted));
    }

    #[test]
    fn test_record_ids_never_reused() {
        let shard = shard();
        let t1 = TxnId::new(SessionId::new(), 1);
        let t2 = TxnId::new(SessionId::new(), 1);

        shard.execute(t1, put("a", json!(1))).unwrap();
        shard.abort(t1).unwrap();
        shard.execute(t2, put("b", json!(2))).unwrap();
        let ts = prepared_at(shard.prepare(t2).unwrap());
        shard.commit(t2, ts).unwrap();

        // The aborted write burned RecordId(1)
        assert_eq!(shard.document("b").unwrap().record_id, RecordId(2));
        assert_eq!(shard.next_record_id(), RecordId(3));
        assert_eq!(shard.high_water_mark(ts), RecordId(2));
    }

    #[test]
    fn test_abort_before_first_operation_blocks_late_operations() {
        let shard = shard();
        let txn = TxnId::new(SessionId::new(), 3);

        assert_eq!(shard.abort(txn), Err(ShardError::NoSuchTransaction(txn)));
        assert_eq!(
            shard.execute(txn, put("late", json!(1))),
            Err(ShardError::NoSuchTransaction(txn))
        );
        assert_eq!(shard.get("late"), None);
        assert!(shard.locks_held_by(txn).is_empty());
    }
}
