//! Resuming coordinations from the transaction log

use crate::error::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use shardtx_common::TxnId;
use shardtx_coordinator::TransactionCoordinatorService;
use shardtx_log::CoordinatorDocument;

/// What a coordinator recovery pass found in the log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRecoveryReport {
    pub scanned: usize,
    /// Decided, delivered and marked collectable; nothing left to do
    pub finished: Vec<TxnId>,
    /// Participant list durable but no decision: decided abort
    pub aborting: Vec<TxnId>,
    /// Decision durable: delivered again
    pub redriving: Vec<TxnId>,
}

impl CoordinatorRecoveryReport {
    pub fn resumed(&self) -> usize {
        self.aborting.len() + self.redriving.len()
    }
}

pub(crate) async fn recover(
    service: &TransactionCoordinatorService,
) -> Result<CoordinatorRecoveryReport> {
    if service.is_stepping_down() {
        return Err(RecoveryError::SteppingDown);
    }

    let documents = service.log().read_all().await?;
    let mut report = CoordinatorRecoveryReport {
        scanned: documents.len(),
        ..Default::default()
    };

    let mut pending: Vec<CoordinatorDocument> = Vec::new();
    for doc in documents {
        match (&doc.decision, doc.collectable_after) {
            (Some(_), Some(_)) => report.finished.push(doc.txn),
            (Some(_), None) => {
                report.redriving.push(doc.txn);
                pending.push(doc);
            }
            (None, _) => {
                report.aborting.push(doc.txn);
                pending.push(doc);
            }
        }
    }

    let resumed = service.resume_from_log(pending);
    // Coordinations this node is already running are left to their task
    report.aborting.retain(|txn| resumed.contains(txn));
    report.redriving.retain(|txn| resumed.contains(txn));

    tracing::info!(
        scanned = report.scanned,
        finished = report.finished.len(),
        aborting = report.aborting.len(),
        redriving = report.redriving.len(),
        "Coordinator recovery started"
    );
    Ok(report)
}
