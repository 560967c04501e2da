//! Client-facing transaction service
//!
//! Every client call checks out the transaction's session for its own
//! duration, so a session is only "active" while an operation runs on it.
//! Commits and aborts are handed to a [`TwoPhaseCommitCoordinator`] task; the
//! client merely waits for it and can be interrupted without affecting it.

use crate::config::CoordinatorConfig;
use crate::coordinator::{
    CoordinationOutcome, CoordinatorContext, CoordinatorStage, CurrentOpEntry, Plan,
    TwoPhaseCommitCoordinator,
};
use crate::error::{CoordinatorError, Result};
use crate::hooks::CoordinatorHooks;
use crate::metrics::{CoordinatorMetrics, MetricsSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardtx_clock::{OpTime, SharedClock};
use shardtx_common::{
    AbortReason, DecisionRecord, Interrupt, ParticipantId, SessionId, TxnId, TxnNumber, TxnState,
};
use shardtx_log::{CoordinatorDocument, DurableLog, GarbageCollector, MajorityCommitPoint};
use shardtx_participant::{OperationResult, ParticipantTransport, ShardOperation, TransportError};
use shardtx_session::{
    KillOutcome, ParticipantList, SessionCatalog, SessionCheckout, SessionError, TransactionRecord,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// `None` for a transaction that touched no participants
    pub commit_timestamp: Option<OpTime>,
}

struct ServiceInner {
    ctx: Arc<CoordinatorContext>,
    coordinators: Mutex<HashMap<TxnId, Arc<TwoPhaseCommitCoordinator>>>,
    garbage_collector: Mutex<Option<GarbageCollector>>,
}

/// Entry point for transactional clients. Clones share the same service.
#[derive(Clone)]
pub struct TransactionCoordinatorService {
    inner: Arc<ServiceInner>,
}

impl TransactionCoordinatorService {
    pub fn new(
        config: CoordinatorConfig,
        catalog: SessionCatalog,
        log: Arc<dyn DurableLog>,
        transport: Arc<dyn ParticipantTransport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                ctx: Arc::new(CoordinatorContext {
                    config,
                    catalog,
                    log,
                    transport,
                    clock,
                    hooks: Arc::new(CoordinatorHooks::new()),
                    metrics: Arc::new(CoordinatorMetrics::new()),
                    step_down: Interrupt::new(),
                }),
                coordinators: Mutex::new(HashMap::new()),
                garbage_collector: Mutex::new(None),
            }),
        }
    }

    fn ctx(&self) -> &CoordinatorContext {
        &self.inner.ctx
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.ctx().config
    }

    pub fn catalog(&self) -> &SessionCatalog {
        &self.ctx().catalog
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.ctx().log
    }

    pub fn clock(&self) -> &SharedClock {
        &self.ctx().clock
    }

    pub fn hooks(&self) -> &Arc<CoordinatorHooks> {
        &self.ctx().hooks
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx().metrics.snapshot()
    }

    /// Running coordinator for `txn`, if any
    pub fn coordinator(&self, txn: TxnId) -> Option<Arc<TwoPhaseCommitCoordinator>> {
        self.inner.coordinators.lock().get(&txn).cloned()
    }

    /// Start attempt `txn_number` on `session_id`
    pub async fn begin_transaction(
        &self,
        session_id: SessionId,
        txn_number: impl Into<TxnNumber>,
    ) -> Result<TransactionHandle> {
        self.check_not_stepping_down()?;
        let txn_number = txn_number.into();

        let checkout = self.catalog().check_out(session_id).await?;
        let start = self.clock().now();
        let superseded = self
            .catalog()
            .start_transaction(&checkout, txn_number, start)?;
        checkout.check_in();

        if let Some(record) = superseded {
            self.release_participants(&record);
        }

        let txn = TxnId::new(session_id, txn_number);
        tracing::debug!(%txn, "Began transaction");
        Ok(TransactionHandle {
            txn,
            service: self.clone(),
        })
    }

    /// Handle for an attempt that already exists, for a client retrying
    /// after losing its original handle
    pub fn handle(&self, txn: TxnId) -> TransactionHandle {
        TransactionHandle {
            txn,
            service: self.clone(),
        }
    }

    /// Run one operation on `participant` inside the transaction.
    ///
    /// The participant joins the transaction before the operation is sent. A
    /// failed operation aborts the whole transaction.
    pub async fn execute(
        &self,
        handle: &TransactionHandle,
        participant: ParticipantId,
        operation: ShardOperation,
    ) -> Result<OperationResult> {
        let txn = handle.txn;
        let checkout = self.check_out(txn).await?;

        let record = self
            .catalog()
            .record_snapshot(txn)
            .ok_or(SessionError::NoSuchTransaction(txn))?;
        match record.state() {
            TxnState::Committed => return Err(CoordinatorError::TransactionCommitted(txn)),
            TxnState::Aborted => return Err(aborted(&record)),
            TxnState::Prepared => return Err(CoordinatorError::CommitInProgress(txn)),
            TxnState::InProgress if record.commit_started() => {
                return Err(CoordinatorError::CommitInProgress(txn));
            }
            TxnState::InProgress => {}
        }

        let added = self.catalog().with_record(txn, |record| {
            record
                .participants_mut()
                .add_participant(participant.clone())
        })?;
        if added {
            tracing::debug!(%txn, %participant, "Participant joined transaction");
        }

        let result = tokio::select! {
            result = self.ctx().transport.send_operation(&participant, txn, operation) => result,
            _ = checkout.interrupt().interrupted() => return Err(SessionError::Interrupted.into()),
        };
        checkout.check_interrupted()?;

        match result {
            Ok(result) => Ok(result),
            Err(source) => {
                let reason = match &source {
                    TransportError::Rejected { error, .. } => AbortReason::OperationFailed {
                        participant: participant.clone(),
                        reason: error.to_string(),
                    },
                    TransportError::Unreachable(_) | TransportError::UnknownParticipant(_) => {
                        AbortReason::ParticipantUnreachable {
                            participant: participant.clone(),
                        }
                    }
                };
                tracing::debug!(%txn, %participant, "Operation failed, aborting: {}", source);
                if let Err(e) = self.abort_active(txn, reason) {
                    tracing::debug!(%txn, "Transaction not aborted after failed operation: {}", e);
                }
                Err(CoordinatorError::OperationFailed {
                    participant,
                    source,
                })
            }
        }
    }

    /// Commit the transaction and wait for the durable decision.
    ///
    /// Calling again for the same attempt returns the same outcome without
    /// redoing any work.
    pub async fn commit_transaction(&self, handle: &TransactionHandle) -> Result<CommitResult> {
        let txn = handle.txn;
        let checkout = self.check_out(txn).await?;

        if let Some(coordinator) = self.coordinator(txn) {
            return self.await_commit(&checkout, &coordinator).await;
        }
        if let Some(decision) = self.durable_decision(txn).await? {
            return commit_result(txn, &decision);
        }

        let record = self
            .catalog()
            .record_snapshot(txn)
            .ok_or(SessionError::NoSuchTransaction(txn))?;
        match record.state() {
            TxnState::Committed => {
                return Ok(CommitResult {
                    commit_timestamp: record
                        .commit_op_time()
                        .filter(|_| !record.participants().is_empty()),
                });
            }
            TxnState::Aborted => return Err(aborted(&record)),
            TxnState::Prepared => return Err(CoordinatorError::DecisionIndeterminate(txn)),
            TxnState::InProgress if record.commit_started() => {
                return Err(CoordinatorError::DecisionIndeterminate(txn));
            }
            TxnState::InProgress => {}
        }

        self.check_not_stepping_down()?;
        let participants = self
            .catalog()
            .with_record(txn, |record| record.participants_mut().freeze())?;

        if participants.is_empty() {
            let now = self.clock().now();
            self.catalog()
                .publish_state(txn, TxnState::Committed, now)?;
            tracing::debug!(%txn, "Committed transaction with no participants");
            return Ok(CommitResult {
                commit_timestamp: None,
            });
        }

        let coordinator = self.spawn(txn, Plan::Commit(participants.clone()), &participants);
        self.await_commit(&checkout, &coordinator).await
    }

    /// Abort the transaction. Fails with `TransactionCommitted` if a commit
    /// decision was already made.
    pub async fn abort_transaction(&self, handle: &TransactionHandle) -> Result<()> {
        let txn = handle.txn;
        let checkout = self.check_out(txn).await?;

        if let Some(coordinator) = self.coordinator(txn) {
            coordinator.request_abort(AbortReason::Explicit);
            let outcome = self.await_outcome(&checkout, &coordinator).await?;
            return match outcome {
                decision if decision.is_commit() => {
                    Err(CoordinatorError::TransactionCommitted(txn))
                }
                _ => Ok(()),
            };
        }
        if let Some(decision) = self.durable_decision(txn).await? {
            return if decision.is_commit() {
                Err(CoordinatorError::TransactionCommitted(txn))
            } else {
                Ok(())
            };
        }

        let record = self
            .catalog()
            .record_snapshot(txn)
            .ok_or(SessionError::NoSuchTransaction(txn))?;
        match record.state() {
            TxnState::Committed => Err(CoordinatorError::TransactionCommitted(txn)),
            TxnState::Aborted => Ok(()),
            TxnState::Prepared => Err(CoordinatorError::DecisionIndeterminate(txn)),
            TxnState::InProgress if record.commit_started() => {
                Err(CoordinatorError::DecisionIndeterminate(txn))
            }
            TxnState::InProgress => {
                if let Some(coordinator) = self.abort_active(txn, AbortReason::Explicit)? {
                    tokio::select! {
                        _ = coordinator.wait_until_done() => {}
                        _ = checkout.interrupt().interrupted() => {
                            return Err(SessionError::Interrupted.into());
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Abort `txn` on behalf of the node, not the client. Interrupts the
    /// operation running on its session. Returns false if the transaction can
    /// no longer be aborted.
    pub fn force_abort(&self, txn: TxnId, reason: AbortReason) -> bool {
        if let Some(coordinator) = self.coordinator(txn) {
            return coordinator.request_abort(reason);
        }

        match self.abort_active(txn, reason.clone()) {
            Ok(_) => {
                self.catalog().interrupt_operation(txn.session_id);
                tracing::info!(%txn, %reason, "Forced abort");
                true
            }
            Err(_) => false,
        }
    }

    /// Kill sessions and their children. Open transactions that have not
    /// begun to commit are aborted; commits already under way are not
    /// affected.
    pub fn kill_sessions(&self, sessions: &[SessionId]) -> Vec<KillOutcome> {
        sessions
            .iter()
            .map(|session_id| {
                let outcome = self.catalog().kill(*session_id);
                for killed in &outcome.killed_sessions {
                    if let Some(record) = self.catalog().current_record(*killed)
                        && record.state() == TxnState::InProgress
                        && !record.commit_started()
                    {
                        let txn = record.txn();
                        if let Err(e) = self.abort_active(txn, AbortReason::SessionKilled) {
                            tracing::debug!(%txn, "Killed session's transaction not aborted: {}", e);
                        }
                    }
                }
                outcome
            })
            .collect()
    }

    /// Monitoring view: every running coordinator plus every open
    /// transaction that has not started to commit
    pub fn current_op(&self) -> Vec<CurrentOpEntry> {
        let coordinators: Vec<_> = self.inner.coordinators.lock().values().cloned().collect();
        let sessions = self.catalog().snapshot();

        let mut entries: Vec<CurrentOpEntry> = coordinators
            .iter()
            .map(|coordinator| {
                let checked_out = self
                    .catalog()
                    .is_checked_out(coordinator.txn().session_id);
                coordinator.current_op(checked_out)
            })
            .collect();

        for session in sessions {
            let Some(record) = session.transaction else {
                continue;
            };
            if record.state() != TxnState::InProgress
                || coordinators.iter().any(|c| c.txn() == record.txn())
            {
                continue;
            }
            entries.push(CurrentOpEntry {
                txn: record.txn(),
                stage: CoordinatorStage::Active,
                blocked_on: None,
                participants: record.participants().iter().cloned().collect(),
                decision: None,
                stage_started: [(CoordinatorStage::Active, record.start_op_time())].into(),
                session_checked_out: session.checked_out,
            });
        }

        entries.sort_by_key(|entry| entry.txn);
        entries
    }

    /// Stop coordinating on this node. Running coordinators halt at their next
    /// step and new transactions are refused; another node resumes from the
    /// log.
    pub fn step_down(&self) {
        tracing::info!("Coordinator service stepping down");
        self.ctx().step_down.interrupt();
    }

    pub fn is_stepping_down(&self) -> bool {
        self.ctx().step_down.is_interrupted()
    }

    /// Finish coordinations read back from the log. Documents without a
    /// decision are decided abort.
    pub fn resume_from_log(&self, documents: Vec<CoordinatorDocument>) -> Vec<TxnId> {
        documents
            .into_iter()
            .filter(|doc| self.coordinator(doc.txn).is_none())
            .map(|doc| {
                let txn = doc.txn;
                let participants = ParticipantList::from(doc.participants.clone());
                tracing::info!(%txn, decided = doc.decision.is_some(), "Resuming coordination");
                self.spawn(txn, Plan::Resume(doc), &participants);
                txn
            })
            .collect()
    }

    /// Delete decided documents as the majority commit point advances
    pub fn start_garbage_collection(&self, commit_point: MajorityCommitPoint) {
        let collector = GarbageCollector::new(self.ctx().log.clone(), commit_point);
        collector.start();
        if let Some(previous) = self.inner.garbage_collector.lock().replace(collector) {
            tokio::spawn(async move { previous.stop().await });
        }
    }

    /// Wait until every running coordinator has finished
    pub async fn wait_for_coordinators(&self) {
        loop {
            let running: Vec<_> = self.inner.coordinators.lock().values().cloned().collect();
            if running.is_empty() {
                return;
            }
            for coordinator in running {
                coordinator.wait_until_done().await;
            }
            tokio::task::yield_now().await;
        }
    }

    fn check_not_stepping_down(&self) -> Result<()> {
        if self.is_stepping_down() {
            return Err(CoordinatorError::SteppingDown);
        }
        Ok(())
    }

    async fn check_out(&self, txn: TxnId) -> Result<SessionCheckout> {
        self.check_not_stepping_down()?;
        Ok(self.catalog().check_out(txn.session_id).await?)
    }

    async fn durable_decision(&self, txn: TxnId) -> Result<Option<DecisionRecord>> {
        Ok(self.ctx().log.read(txn).await?.and_then(|doc| doc.decision))
    }

    async fn await_outcome(
        &self,
        checkout: &SessionCheckout,
        coordinator: &TwoPhaseCommitCoordinator,
    ) -> Result<DecisionRecord> {
        let txn = coordinator.txn();
        let outcome = tokio::select! {
            outcome = coordinator.wait_for_decision() => outcome,
            _ = checkout.interrupt().interrupted() => return Err(SessionError::Interrupted.into()),
        };

        match outcome {
            CoordinationOutcome::Decided(decision) => Ok(decision),
            CoordinationOutcome::Indeterminate(_) => {
                Err(CoordinatorError::DecisionIndeterminate(txn))
            }
            CoordinationOutcome::SteppedDown => Err(CoordinatorError::SteppingDown),
            CoordinationOutcome::InvariantViolation(e) => {
                Err(CoordinatorError::InvariantViolation(e))
            }
        }
    }

    async fn await_commit(
        &self,
        checkout: &SessionCheckout,
        coordinator: &TwoPhaseCommitCoordinator,
    ) -> Result<CommitResult> {
        let decision = self.await_outcome(checkout, coordinator).await?;
        commit_result(coordinator.txn(), &decision)
    }

    /// Abort an open transaction that has not begun to commit. The record is
    /// aborted at once; participants are released in the background.
    fn abort_active(
        &self,
        txn: TxnId,
        reason: AbortReason,
    ) -> Result<Option<Arc<TwoPhaseCommitCoordinator>>> {
        let now = self.clock().now();
        let participants = self.catalog().with_record(txn, |record| {
            if record.state() != TxnState::InProgress || record.commit_started() {
                return Err(SessionError::InvalidTransition {
                    txn,
                    from: record.state(),
                    to: TxnState::Aborted,
                });
            }
            let participants = record.participants().list();
            record.abort(reason.clone(), now)?;
            Ok(participants)
        })?;

        if participants.is_empty() {
            return Ok(None);
        }
        let plan = Plan::Abort {
            participants: participants.clone(),
            reason,
        };
        Ok(Some(self.spawn(txn, plan, &participants)))
    }

    /// Send aborts to the participants of a superseded attempt
    fn release_participants(&self, record: &TransactionRecord) {
        let participants = record.participants().list();
        if participants.is_empty() {
            return;
        }
        let reason = record
            .abort_reason()
            .cloned()
            .unwrap_or(AbortReason::Explicit);
        self.spawn(
            record.txn(),
            Plan::Abort {
                participants: participants.clone(),
                reason,
            },
            &participants,
        );
    }

    fn spawn(
        &self,
        txn: TxnId,
        plan: Plan,
        participants: &[ParticipantId],
    ) -> Arc<TwoPhaseCommitCoordinator> {
        let coordinator = TwoPhaseCommitCoordinator::new(self.inner.ctx.clone(), txn, participants);
        self.inner
            .coordinators
            .lock()
            .insert(txn, coordinator.clone());

        let inner = self.inner.clone();
        let task = coordinator.clone();
        tokio::spawn(async move {
            task.clone().run(plan).await;
            let mut coordinators = inner.coordinators.lock();
            if coordinators
                .get(&txn)
                .is_some_and(|running| Arc::ptr_eq(running, &task))
            {
                coordinators.remove(&txn);
            }
        });

        coordinator
    }
}

impl std::fmt::Debug for TransactionCoordinatorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinatorService")
            .field("coordinators", &self.inner.coordinators.lock().len())
            .field("stepping_down", &self.is_stepping_down())
            .finish()
    }
}

fn aborted(record: &TransactionRecord) -> CoordinatorError {
    CoordinatorError::TransactionAborted {
        txn: record.txn(),
        reason: record
            .abort_reason()
            .cloned()
            .unwrap_or(AbortReason::Explicit),
    }
}

fn commit_result(txn: TxnId, decision: &DecisionRecord) -> Result<CommitResult> {
    if decision.is_commit() {
        Ok(CommitResult {
            commit_timestamp: decision.commit_timestamp,
        })
    } else {
        Err(CoordinatorError::TransactionAborted {
            txn,
            reason: decision
                .abort_reason
                .clone()
                .unwrap_or(AbortReason::Explicit),
        })
    }
}

/// A client's handle on one transaction attempt
#[derive(Clone)]
pub struct TransactionHandle {
    txn: TxnId,
    service: TransactionCoordinatorService,
}

impl TransactionHandle {
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn session_id(&self) -> SessionId {
        self.txn.session_id
    }

    pub fn txn_number(&self) -> TxnNumber {
        self.txn.txn_number
    }

    pub async fn execute(
        &self,
        participant: impl Into<ParticipantId>,
        operation: ShardOperation,
    ) -> Result<OperationResult> {
        self.service
            .execute(self, participant.into(), operation)
            .await
    }

    pub async fn commit(&self) -> Result<CommitResult> {
        self.service.commit_transaction(self).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.service.abort_transaction(self).await
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("txn", &self.txn)
            .finish()
    }
}
