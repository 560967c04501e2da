//! In-memory transaction log for testing

use crate::document::CoordinatorDocument;
use crate::error::{LogError, Result};
use crate::DurableLog;
use async_trait::async_trait;
use parking_lot::Mutex;
use shardtx_clock::OpTime;
use shardtx_common::{DecisionRecord, ParticipantId, TxnId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// In-memory log. Sharing one instance between two coordinator services
/// simulates a node restart over the same durable state.
#[derive(Default)]
pub struct MemoryTransactionLog {
    docs: Mutex<BTreeMap<TxnId, CoordinatorDocument>>,

    /// Writes that will fail with a transient error before writes succeed again
    failing_writes: AtomicU32,

    /// Successful writes that changed a document
    writes: AtomicU64,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with [`LogError::Unavailable`]
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of writes that changed a document
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match failed {
            Ok(_) => Err(LogError::Unavailable("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn update(
        &self,
        txn: TxnId,
        transition: impl FnOnce(Option<&CoordinatorDocument>) -> Result<Option<CoordinatorDocument>>,
    ) -> Result<()> {
        self.check_available()?;

        let mut docs = self.docs.lock();
        if let Some(updated) = transition(docs.get(&txn))? {
            docs.insert(txn, updated);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl DurableLog for MemoryTransactionLog {
    async fn persist_participant_list(
        &self,
        txn: TxnId,
        participants: &[ParticipantId],
    ) -> Result<()> {
        self.update(txn, |existing| {
            CoordinatorDocument::with_participants(existing, txn, participants)
        })
    }

    async fn persist_decision(&self, txn: TxnId, decision: &DecisionRecord) -> Result<()> {
        self.update(txn, |existing| {
            CoordinatorDocument::with_decision(existing, txn, decision)
        })
    }

    async fn mark_garbage_collectable(&self, txn: TxnId, after: OpTime) -> Result<()> {
        self.update(txn, |existing| {
            CoordinatorDocument::with_collectable_after(existing, txn, after)
        })
    }

    async fn read(&self, txn: TxnId) -> Result<Option<CoordinatorDocument>> {
        Ok(self.docs.lock().get(&txn).cloned())
    }

    async fn read_all(&self) -> Result<Vec<CoordinatorDocument>> {
        Ok(self.docs.lock().values().cloned().collect())
    }

    async fn collect_garbage(&self, majority: OpTime) -> Result<Vec<TxnId>> {
        let mut docs = self.docs.lock();
        let collectable: Vec<TxnId> = docs
            .values()
            .filter(|doc| doc.is_collectable(majority))
            .map(|doc| doc.txn)
            .collect();

        for txn in &collectable {
            docs.remove(txn);
        }
        Ok(collectable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardtx_common::{AbortReason, SessionId};

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let log = MemoryTransactionLog::new();
        let txn = TxnId::new(SessionId::new(), 1);
        let participants = vec![ParticipantId::from("shard-a")];

        log.fail_next_writes(2);
        assert!(
            log.persist_participant_list(txn, &participants)
                .await
                .unwrap_err()
                .is_transient()
        );
        assert!(log.persist_participant_list(txn, &participants).await.is_err());
        log.persist_participant_list(txn, &participants).await.unwrap();

        assert_eq!(log.write_count(), 1);
        assert!(log.read(txn).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_collect_garbage_removes_only_eligible() {
        let log = MemoryTransactionLog::new();
        let session = SessionId::new();
        let decided = TxnId::new(session, 1);
        let pending = TxnId::new(session, 2);
        let participants = vec![ParticipantId::from("shard-a")];

        log.persist_participant_list(decided, &participants).await.unwrap();
        log.persist_participant_list(pending, &participants).await.unwrap();
        log.persist_decision(
            decided,
            &DecisionRecord::abort(AbortReason::Explicit, OpTime::new(10, 0)),
        )
        .await
        .unwrap();
        log.mark_garbage_collectable(decided, OpTime::new(20, 0))
            .await
            .unwrap();

        assert!(log.collect_garbage(OpTime::new(19, 0)).await.unwrap().is_empty());
        assert_eq!(
            log.collect_garbage(OpTime::new(25, 0)).await.unwrap(),
            vec![decided]
        );

        let remaining = log.read_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].txn, pending);
    }
}
