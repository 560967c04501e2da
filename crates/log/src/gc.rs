//! Majority commit point tracking and background collection of decided records

use crate::DurableLog;
use parking_lot::Mutex;
use shardtx_clock::OpTime;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The newest op time known to be durable on a majority of nodes.
///
/// Only moves forward.
#[derive(Clone)]
pub struct MajorityCommitPoint {
    tx: Arc<watch::Sender<OpTime>>,
}

impl MajorityCommitPoint {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(OpTime::NULL);
        Self { tx: Arc::new(tx) }
    }

    /// Advance the commit point. Older values are ignored.
    pub fn advance(&self, to: OpTime) {
        self.tx.send_if_modified(|current| {
            if to > *current {
                *current = to;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> OpTime {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OpTime> {
        self.tx.subscribe()
    }
}

impl Default for MajorityCommitPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Deletes collectable coordinator documents whenever the majority commit
/// point advances.
pub struct GarbageCollector {
    log: Arc<dyn DurableLog>,
    commit_point: MajorityCommitPoint,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new(log: Arc<dyn DurableLog>, commit_point: MajorityCommitPoint) -> Self {
        Self {
            log,
            commit_point,
            task: Mutex::new(None),
        }
    }

    /// Start the background collection task
    pub fn start(&self) {
        let log = self.log.clone();
        let mut rx = self.commit_point.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let majority = *rx.borrow_and_update();
                match log.collect_garbage(majority).await {
                    Ok(collected) if !collected.is_empty() => {
                        tracing::debug!(
                            %majority,
                            count = collected.len(),
                            "Collected decided transaction records"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(%majority, "Failed to collect transaction records: {}", e);
                    }
                }

                if rx.changed().await.is_err() {
                    return;
                }
            }
        });

        *self.task.lock() = Some(task);
    }

    /// Collect once, synchronously with the caller
    pub async fn collect_now(&self) -> crate::Result<usize> {
        let collected = self
            .log
            .collect_garbage(self.commit_point.current())
            .await?;
        Ok(collected.len())
    }

    /// Stop the background task
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
