//! Durable transaction log with fjall backend

use crate::config::LogConfig;
use crate::document::CoordinatorDocument;
use crate::error::Result;
use crate::DurableLog;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use shardtx_clock::OpTime;
use shardtx_common::{DecisionRecord, ParticipantId, TxnId};
use std::sync::Arc;

const DOCS_PARTITION: &str = "coordinator_docs";

/// Transaction log persisted in a fjall keyspace.
///
/// Documents are keyed by [`TxnId::to_key`]; every write is followed by
/// `persist` with the configured mode before it is acknowledged. Storage work
/// runs on tokio's blocking pool.
pub struct FjallTransactionLog {
    store: Arc<DocumentStore>,
}

struct DocumentStore {
    keyspace: Keyspace,
    docs: PartitionHandle,
    config: LogConfig,

    /// Serializes read-modify-write cycles on documents
    write_lock: Mutex<()>,
}

impl FjallTransactionLog {
    /// Open (or create) the log in `config.data_dir`
    pub fn open(config: LogConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.block_cache_size)
            .open()?;

        let docs = keyspace.open_partition(
            DOCS_PARTITION,
            PartitionCreateOptions::default()
                .block_size(16 * 1024) // Small documents
                .compression(fjall::CompressionType::None),
        )?;

        tracing::info!(
            path = %config.data_dir.display(),
            "Opened durable transaction log"
        );

        Ok(Self {
            store: Arc::new(DocumentStore {
                keyspace,
                docs,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.store.config
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }
}

impl DocumentStore {
    fn get(&self, txn: &TxnId) -> Result<Option<CoordinatorDocument>> {
        match self.docs.get(txn.to_key())? {
            Some(bytes) => Ok(Some(CoordinatorDocument::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update(
        &self,
        txn: TxnId,
        transition: impl FnOnce(Option<&CoordinatorDocument>) -> Result<Option<CoordinatorDocument>>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();

        let existing = self.get(&txn)?;
        if let Some(updated) = transition(existing.as_ref())? {
            self.docs.insert(txn.to_key(), updated.to_bytes()?)?;
            self.keyspace.persist(self.config.persist_mode)?;
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<CoordinatorDocument>> {
        let mut docs = Vec::new();
        for entry in self.docs.iter() {
            let (_key, value) = entry?;
            docs.push(CoordinatorDocument::from_bytes(&value)?);
        }
        Ok(docs)
    }

    fn collect_garbage(&self, majority: OpTime) -> Result<Vec<TxnId>> {
        let _guard = self.write_lock.lock();

        let mut collected = Vec::new();
        for entry in self.docs.iter() {
            let (_key, value) = entry?;
            let doc = CoordinatorDocument::from_bytes(&value)?;
            if doc.is_collectable(majority) {
                collected.push(doc.txn);
            }
        }

        if !collected.is_empty() {
            let mut batch = self.keyspace.batch();
            for txn in &collected {
                batch.remove(&self.docs, txn.to_key());
            }
            batch.commit()?;
            self.keyspace.persist(self.config.persist_mode)?;
        }

        Ok(collected)
    }
}

#[async_trait]
impl DurableLog for FjallTransactionLog {
    async fn persist_participant_list(
        &self,
        txn: TxnId,
        participants: &[ParticipantId],
    ) -> Result<()> {
        let participants = participants.to_vec();
        self.blocking(move |store| {
            store.update(txn, |existing| {
                CoordinatorDocument::with_participants(existing, txn, &participants)
            })
        })
        .await
    }

    async fn persist_decision(&self, txn: TxnId, decision: &DecisionRecord) -> Result<()> {
        let decision = decision.clone();
        self.blocking(move |store| {
            store.update(txn, |existing| {
                CoordinatorDocument::with_decision(existing, txn, &decision)
            })
        })
        .await
    }

    async fn mark_garbage_collectable(&self, txn: TxnId, after: OpTime) -> Result<()> {
        self.blocking(move |store| {
            store.update(txn, |existing| {
                CoordinatorDocument::with_collectable_after(existing, txn, after)
            })
        })
        .await
    }

    async fn read(&self, txn: TxnId) -> Result<Option<CoordinatorDocument>> {
        self.blocking(move |store| store.get(&txn)).await
    }

    async fn read_all(&self) -> Result<Vec<CoordinatorDocument>> {
        self.blocking(|store| store.read_all()).await
    }

    async fn collect_garbage(&self, majority: OpTime) -> Result<Vec<TxnId>> {
        self.blocking(move |store| store.collect_garbage(majority))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogError;
    use shardtx_common::{AbortReason, SessionId};

    fn participants() -> Vec<ParticipantId> {
        vec!["shard-a".into(), "shard-b".into()]
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let txn = TxnId::new(SessionId::new(), 3);
        let decision = DecisionRecord::commit(OpTime::new(40, 0), OpTime::new(41, 0));

        {
            let log = FjallTransactionLog::open(LogConfig::for_testing(dir.path().to_path_buf()))
                .unwrap();
            log.persist_participant_list(txn, &participants()).await.unwrap();
            log.persist_decision(txn, &decision).await.unwrap();
        }

        let log =
            FjallTransactionLog::open(LogConfig::for_testing(dir.path().to_path_buf())).unwrap();
        let doc = log.read(txn).await.unwrap().expect("document persisted");

        assert_eq!(doc.participants, participants());
        assert_eq!(doc.decision, Some(decision));
    }

    #[tokio::test]
    async fn test_conflicting_decision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log =
            FjallTransactionLog::open(LogConfig::for_testing(dir.path().to_path_buf())).unwrap();
        let txn = TxnId::new(SessionId::new(), 1);

        log.persist_participant_list(txn, &participants()).await.unwrap();
        log.persist_decision(
            txn,
            &DecisionRecord::abort(AbortReason::Explicit, OpTime::new(5, 0)),
        )
        .await
        .unwrap();

        // Same outcome again is fine
        log.persist_decision(
            txn,
            &DecisionRecord::abort(AbortReason::Recovery, OpTime::new(9, 0)),
        )
        .await
        .unwrap();

        let err = log
            .persist_decision(
                txn,
                &DecisionRecord::commit(OpTime::new(5, 0), OpTime::new(6, 0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::ConflictingDecision { .. }));

        let doc = log.read(txn).await.unwrap().unwrap();
        assert!(!doc.decision.unwrap().is_commit());
    }

    #[tokio::test]
    async fn test_collect_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let log =
            FjallTransactionLog::open(LogConfig::for_testing(dir.path().to_path_buf())).unwrap();
        let session = SessionId::new();
        let txns: Vec<TxnId> = (1..=3).map(|n| TxnId::new(session, n)).collect();

        for txn in &txns {
            log.persist_participant_list(*txn, &participants()).await.unwrap();
            log.persist_decision(
                *txn,
                &DecisionRecord::abort(AbortReason::Explicit, OpTime::new(5, 0)),
            )
            .await
            .unwrap();
        }
        log.mark_garbage_collectable(txns[0], OpTime::new(10, 0))
            .await
            .unwrap();
        log.mark_garbage_collectable(txns[1], OpTime::new(30, 0))
            .await
            .unwrap();

        let collected = log.collect_garbage(OpTime::new(20, 0)).await.unwrap();
        assert_eq!(collected, vec![txns[0]]);

        let remaining: Vec<TxnId> = log
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.txn)
            .collect();
        assert_eq!(remaining, vec![txns[1], txns[2]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_share_the_keyspace() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            FjallTransactionLog::open(LogConfig::for_testing(dir.path().to_path_buf())).unwrap(),
        );
        let session = SessionId::new();

        let writers: Vec<_> = (1..=8u64)
            .map(|n| {
                let log = log.clone();
                tokio::spawn(async move {
                    let txn = TxnId::new(session, n);
                    log.persist_participant_list(txn, &participants()).await?;
                    log.persist_decision(
                        txn,
                        &DecisionRecord::abort(AbortReason::Explicit, OpTime::new(n, 0)),
                    )
                    .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let docs = log.read_all().await.unwrap();
        assert_eq!(docs.len(), 8);
        assert!(docs.iter().all(|doc| doc.decision.is_some()));
    }
}
