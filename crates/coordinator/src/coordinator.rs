//! Two-phase commit for one transaction
//!
//! A [`TwoPhaseCommitCoordinator`] runs as a background task that nothing on
//! the client's side can cancel. The order of effects is fixed:
//!
//! 1. The participant list is made durable before any prepare is sent.
//! 2. Votes are collected. Any no vote, vote timeout or accepted abort request
//!    decides abort; a unanimous yes commits at the latest prepare timestamp.
//! 3. The decision is made durable before any participant hears about it.
//! 4. The decision is delivered to every participant until acknowledged.
//! 5. The coordinator document is marked collectable.
//!
//! Log writes that keep failing leave the decision indeterminate: the
//! coordinator stops without sending anything further and recovery settles
//! the transaction from whatever reached the log.

use crate::config::CoordinatorConfig;
use crate::hooks::{CoordinatorHooks, HookOutcome, SuspensionPoint};
use crate::metrics::CoordinatorMetrics;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardtx_clock::{OpTime, SharedClock};
use shardtx_common::{
    AbortReason, CommitDecision, DecisionRecord, Interrupt, ParticipantId, PrepareVote, TxnId,
    TxnState,
};
use shardtx_log::{CoordinatorDocument, DurableLog, LogError, persist_with_retry};
use shardtx_participant::{ParticipantTransport, TransportError};
use shardtx_session::{
    Participant, ParticipantList, ParticipantRegistry, SessionCatalog, SessionError,
    TransactionRecord,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::time::error::Elapsed;

/// Where a coordinator is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoordinatorStage {
    Active,
    Preparing,
    Deciding,
    Committing,
    Aborting,
    Done,
}

/// What a coordinator is currently waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedOn {
    LogWrite,
    Votes,
    DecisionAcks,
    SuspensionPoint(SuspensionPoint),
}

/// What a client waiting on a coordinator learns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationOutcome {
    Decided(DecisionRecord),
    /// A log write kept failing. The decision is unknown until recovery reads
    /// the log.
    Indeterminate(String),
    SteppedDown,
    InvariantViolation(String),
}

/// Monitoring entry for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentOpEntry {
    pub txn: TxnId,
    pub stage: CoordinatorStage,
    pub blocked_on: Option<BlockedOn>,
    pub participants: Vec<Participant>,
    pub decision: Option<CommitDecision>,
    /// When each stage reached so far was entered
    pub stage_started: BTreeMap<CoordinatorStage, OpTime>,
    /// A client operation currently holds the session
    pub session_checked_out: bool,
}

/// Everything a coordinator needs from its service
pub(crate) struct CoordinatorContext {
    pub config: CoordinatorConfig,
    pub catalog: SessionCatalog,
    pub log: Arc<dyn DurableLog>,
    pub transport: Arc<dyn ParticipantTransport>,
    pub clock: SharedClock,
    pub hooks: Arc<CoordinatorHooks>,
    pub metrics: Arc<CoordinatorMetrics>,
    /// Fired when this node stops coordinating
    pub step_down: Interrupt,
}

/// The work a coordinator was started for
pub(crate) enum Plan {
    /// Full two-phase commit
    Commit(ParticipantList),
    /// Abort a transaction that never reached prepare. Nothing is logged.
    Abort {
        participants: ParticipantList,
        reason: AbortReason,
    },
    /// Finish a coordination found in the log after a restart
    Resume(CoordinatorDocument),
}

/// Why a coordinator stopped short of Done's normal path
enum Stop {
    SteppedDown,
    Crashed(SuspensionPoint),
    Indeterminate(String),
    Invariant(String),
}

impl Stop {
    fn from_log(err: LogError) -> Self {
        if !err.is_fatal() && (err.is_transient() || matches!(err, LogError::RetriesExhausted { .. }))
        {
            Stop::Indeterminate(err.to_string())
        } else {
            Stop::Invariant(err.to_string())
        }
    }
}

/// Abort requests are one-shot: once one is accepted no other is
enum AbortRequest {
    None,
    Pending(AbortReason),
    Taken,
}

struct Progress {
    stage: CoordinatorStage,
    stage_started: BTreeMap<CoordinatorStage, OpTime>,
    blocked_on: Option<BlockedOn>,
    registry: ParticipantRegistry,
    decision: Option<DecisionRecord>,
}

/// Drives one transaction to a durable decision and delivers it
pub struct TwoPhaseCommitCoordinator {
    txn: TxnId,
    ctx: Arc<CoordinatorContext>,
    progress: Mutex<Progress>,
    abort_request: Mutex<AbortRequest>,
    abort_requested: Notify,
    outcome: watch::Sender<Option<CoordinationOutcome>>,
    done: watch::Sender<bool>,
}

impl TwoPhaseCommitCoordinator {
    pub(crate) fn new(
        ctx: Arc<CoordinatorContext>,
        txn: TxnId,
        participants: &[ParticipantId],
    ) -> Arc<Self> {
        let now = ctx.clock.now();
        ctx.metrics.created(CoordinatorStage::Active);

        Arc::new(Self {
            txn,
            progress: Mutex::new(Progress {
                stage: CoordinatorStage::Active,
                stage_started: BTreeMap::from([(CoordinatorStage::Active, now)]),
                blocked_on: None,
                registry: ParticipantRegistry::frozen_with(participants),
                decision: None,
            }),
            ctx,
            abort_request: Mutex::new(AbortRequest::None),
            abort_requested: Notify::new(),
            outcome: watch::channel(None).0,
            done: watch::channel(false).0,
        })
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn stage(&self) -> CoordinatorStage {
        self.progress.lock().stage
    }

    /// The decision, once durable
    pub fn decision(&self) -> Option<DecisionRecord> {
        self.progress.lock().decision.clone()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.progress.lock().registry.iter().cloned().collect()
    }

    /// Ask for an abort. Accepted only before the coordinator starts
    /// deciding, and only once.
    pub fn request_abort(&self, reason: AbortReason) -> bool {
        let progress = self.progress.lock();
        if progress.stage > CoordinatorStage::Preparing {
            return false;
        }

        let mut request = self.abort_request.lock();
        if !matches!(*request, AbortRequest::None) {
            return false;
        }
        tracing::debug!(txn = %self.txn, %reason, "Abort requested");
        *request = AbortRequest::Pending(reason);
        drop(request);
        drop(progress);

        self.abort_requested.notify_waiters();
        true
    }

    /// Wait until the decision is durable or the coordinator gives up
    pub async fn wait_for_decision(&self) -> CoordinationOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return CoordinationOutcome::SteppedDown;
            }
        }
    }

    /// Wait until the background task has finished
    pub async fn wait_until_done(&self) {
        let mut rx = self.done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn current_op(&self, session_checked_out: bool) -> CurrentOpEntry {
        let progress = self.progress.lock();
        CurrentOpEntry {
            txn: self.txn,
            stage: progress.stage,
            blocked_on: progress.blocked_on,
            participants: progress.registry.iter().cloned().collect(),
            decision: progress.decision.as_ref().map(|d| d.decision),
            stage_started: progress.stage_started.clone(),
            session_checked_out,
        }
    }

    pub(crate) async fn run(self: Arc<Self>, plan: Plan) {
        let result = match plan {
            Plan::Commit(participants) => self.commit(&participants).await,
            Plan::Abort {
                participants,
                reason,
            } => self.abort_unprepared(&participants, reason).await,
            Plan::Resume(doc) => self.resume(doc).await,
        };

        if let Err(stop) = result {
            self.stopped(stop);
        }
        self.set_stage(CoordinatorStage::Done);
        self.done.send_replace(true);
    }

    async fn commit(&self, participants: &[ParticipantId]) -> Result<(), Stop> {
        let txn = self.txn;
        let log = self.ctx.log.clone();

        self.set_stage(CoordinatorStage::Preparing);
        self.ctx.metrics.started_two_phase_commit();
        self.suspend(SuspensionPoint::BeforeWritingParticipantList)
            .await?;

        // Nothing is durable yet, so an early abort needs no log write
        if let Some(reason) = self.take_abort_request() {
            return self.abort_unprepared(participants, reason).await;
        }

        self.persist("persist participant list", || {
            log.persist_participant_list(txn, participants)
        })
        .await?;
        tracing::debug!(%txn, participants = participants.len(), "Participant list durable");

        self.suspend(SuspensionPoint::BeforeSendingPrepare).await?;
        let vote_abort = self.collect_votes(participants).await?;

        let requested = self.enter_deciding();
        let decision = match vote_abort.or(requested) {
            Some(reason) => DecisionRecord::abort(reason, self.ctx.clock.now()),
            None => {
                let commit_timestamp = self
                    .progress
                    .lock()
                    .registry
                    .max_prepare_timestamp()
                    .ok_or_else(|| {
                        Stop::Invariant(format!("{} voted yes without prepare timestamps", txn))
                    })?;
                self.ctx.clock.advance(commit_timestamp);
                self.update_record(|record| record.transition(TxnState::Prepared, commit_timestamp));
                DecisionRecord::commit(commit_timestamp, self.ctx.clock.now())
            }
        };

        self.suspend(SuspensionPoint::BeforeWritingDecision).await?;
        self.persist("persist decision", || log.persist_decision(txn, &decision))
            .await?;
        self.decided(&decision);

        self.deliver(participants, &decision).await?;
        self.mark_collectable().await
    }

    async fn abort_unprepared(
        &self,
        participants: &[ParticipantId],
        reason: AbortReason,
    ) -> Result<(), Stop> {
        let decision = DecisionRecord::abort(reason, self.ctx.clock.now());
        self.decided(&decision);
        self.deliver(participants, &decision).await
    }

    async fn resume(&self, doc: CoordinatorDocument) -> Result<(), Stop> {
        let txn = self.txn;
        let log = self.ctx.log.clone();

        let decision = match doc.decision {
            Some(decision) => decision,
            None => {
                // Nobody can have been told to commit
                self.enter_deciding();
                let decision = DecisionRecord::abort(AbortReason::Recovery, self.ctx.clock.now());
                self.suspend(SuspensionPoint::BeforeWritingDecision).await?;
                self.persist("persist decision", || log.persist_decision(txn, &decision))
                    .await?;
                decision
            }
        };
        self.decided(&decision);

        self.deliver(&doc.participants, &decision).await?;
        if doc.collectable_after.is_none() {
            self.mark_collectable().await?;
        }
        Ok(())
    }

    async fn collect_votes(
        &self,
        participants: &[ParticipantId],
    ) -> Result<Option<AbortReason>, Stop> {
        self.set_blocked(Some(BlockedOn::Votes));
        let vote_timeout = self.ctx.config.vote_timeout;

        let mut pending: FuturesUnordered<_> = participants
            .iter()
            .map(|participant| {
                let ctx = self.ctx.clone();
                let participant = participant.clone();
                let txn = self.txn;
                async move {
                    let vote =
                        tokio::time::timeout(vote_timeout, request_vote(&ctx, &participant, txn))
                            .await;
                    (participant, vote)
                }
            })
            .collect();

        // Stop at the first no: the outcome cannot change
        let result = loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((participant, vote)) => {
                        if let Some(reason) = self.record_vote(&participant, vote) {
                            break Ok(Some(reason));
                        }
                    }
                    None => break Ok(None),
                },
                reason = self.abort_requested() => break Ok(Some(reason)),
                _ = self.ctx.step_down.interrupted() => break Err(Stop::SteppedDown),
            }
        };

        self.set_blocked(None);
        result
    }

    fn record_vote(
        &self,
        participant: &ParticipantId,
        vote: Result<Result<PrepareVote, TransportError>, Elapsed>,
    ) -> Option<AbortReason> {
        let (vote, abort) = match vote {
            Ok(Ok(vote)) => {
                let abort = match &vote {
                    PrepareVote::Commit { .. } => None,
                    PrepareVote::Abort { reason } => Some(AbortReason::VotedNo {
                        participant: participant.clone(),
                        reason: reason.clone(),
                    }),
                };
                (Some(vote), abort)
            }
            Ok(Err(TransportError::Rejected { error, .. })) => (
                None,
                Some(AbortReason::VotedNo {
                    participant: participant.clone(),
                    reason: error.to_string(),
                }),
            ),
            Ok(Err(_)) => (
                None,
                Some(AbortReason::ParticipantUnreachable {
                    participant: participant.clone(),
                }),
            ),
            Err(_) => (
                None,
                Some(AbortReason::VoteTimeout {
                    participant: participant.clone(),
                }),
            ),
        };
        tracing::debug!(txn = %self.txn, %participant, ?vote, "Vote recorded");

        if let Err(e) = self
            .progress
            .lock()
            .registry
            .record_vote(participant, vote.as_ref())
        {
            tracing::warn!(txn = %self.txn, "Failed to record vote: {}", e);
        }
        self.update_record(|record| {
            record
                .participants_mut()
                .record_vote(participant, vote.as_ref())
        });

        abort
    }

    async fn deliver(
        &self,
        participants: &[ParticipantId],
        decision: &DecisionRecord,
    ) -> Result<(), Stop> {
        let stage = match decision.decision {
            CommitDecision::Commit => CoordinatorStage::Committing,
            CommitDecision::Abort => CoordinatorStage::Aborting,
        };
        self.set_stage(stage);
        self.suspend(SuspensionPoint::BeforeSendingDecision).await?;

        let commit_timestamp = match (decision.decision, decision.commit_timestamp) {
            (CommitDecision::Commit, Some(ts)) => Some(ts),
            (CommitDecision::Commit, None) => {
                return Err(Stop::Invariant(format!(
                    "commit decision for {} has no commit timestamp",
                    self.txn
                )));
            }
            (CommitDecision::Abort, _) => None,
        };

        self.set_blocked(Some(BlockedOn::DecisionAcks));
        let deliveries = participants
            .iter()
            .map(|participant| self.deliver_to(participant, commit_timestamp));

        tokio::select! {
            _ = join_all(deliveries) => {}
            _ = self.ctx.step_down.interrupted() => return Err(Stop::SteppedDown),
        }

        self.set_blocked(None);
        tracing::debug!(txn = %self.txn, decision = %decision.decision, "All participants acknowledged");
        Ok(())
    }

    /// Send the decision to one participant until it acknowledges
    async fn deliver_to(&self, participant: &ParticipantId, commit_timestamp: Option<OpTime>) {
        let policy = &self.ctx.config.decision_retry;
        let mut backoff = policy.backoff();

        loop {
            let result = match commit_timestamp {
                Some(ts) => {
                    self.ctx
                        .transport
                        .send_commit(participant, self.txn, ts)
                        .await
                }
                None => self.ctx.transport.send_abort(participant, self.txn).await,
            };

            match result {
                Ok(()) => break,
                // The participant never saw the transaction or already forgot it
                Err(e) if commit_timestamp.is_none() && e.is_no_such_transaction() => break,
                Err(e) => {
                    tracing::debug!(
                        txn = %self.txn,
                        %participant,
                        attempt = backoff.attempts(),
                        "Decision not acknowledged: {}", e
                    );
                    if !backoff.wait().await {
                        backoff = policy.backoff();
                    }
                }
            }
        }

        if let Err(e) = self
            .progress
            .lock()
            .registry
            .mark_acknowledged(participant)
        {
            tracing::warn!(txn = %self.txn, "Failed to record acknowledgement: {}", e);
        }
        self.update_record(|record| record.participants_mut().mark_acknowledged(participant));
    }

    async fn mark_collectable(&self) -> Result<(), Stop> {
        let txn = self.txn;
        let log = self.ctx.log.clone();

        self.suspend(SuspensionPoint::BeforeMarkingCollectable)
            .await?;
        let after = self
            .ctx
            .clock
            .now()
            .add(self.ctx.config.decision_retention);

        match self
            .persist("mark garbage collectable", || {
                log.mark_garbage_collectable(txn, after)
            })
            .await
        {
            Err(Stop::Indeterminate(e)) | Err(Stop::Invariant(e)) => {
                // Decision is already delivered; recovery marks it again
                tracing::warn!(%txn, "Coordinator document left in place: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// Publish a durable decision to waiters, metrics and the session record
    fn decided(&self, decision: &DecisionRecord) {
        self.progress.lock().decision = Some(decision.clone());

        match (decision.decision, &decision.abort_reason) {
            (CommitDecision::Commit, _) => {
                self.ctx.metrics.committed();
                let at = decision.commit_timestamp.unwrap_or(decision.decision_time);
                self.update_record(|record| record.transition(TxnState::Committed, at));
            }
            (CommitDecision::Abort, reason) => {
                self.ctx.metrics.aborted();
                let reason = reason.clone().unwrap_or(AbortReason::Explicit);
                self.update_record(|record| record.abort(reason, decision.decision_time));
            }
        }

        tracing::info!(txn = %self.txn, decision = %decision.decision, "Transaction decided");
        self.outcome
            .send_replace(Some(CoordinationOutcome::Decided(decision.clone())));
    }

    fn stopped(&self, stop: Stop) {
        let outcome = match stop {
            Stop::SteppedDown => {
                tracing::info!(txn = %self.txn, "Coordinator stepped down");
                CoordinationOutcome::SteppedDown
            }
            Stop::Crashed(point) => {
                tracing::info!(txn = %self.txn, %point, "Coordinator halted");
                CoordinationOutcome::SteppedDown
            }
            Stop::Indeterminate(e) => {
                tracing::warn!(txn = %self.txn, "Decision indeterminate: {}", e);
                CoordinationOutcome::Indeterminate(e)
            }
            Stop::Invariant(e) => {
                tracing::error!(txn = %self.txn, "Invariant violation, coordination halted: {}", e);
                CoordinationOutcome::InvariantViolation(e)
            }
        };

        // Waiters that already saw a durable decision keep it
        self.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    async fn persist<F, Fut>(&self, what: &'static str, write: F) -> Result<(), Stop>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = shardtx_log::Result<()>>,
    {
        self.set_blocked(Some(BlockedOn::LogWrite));
        let result = tokio::select! {
            result = persist_with_retry(&self.ctx.config.log_retry, what, self.txn, write) => {
                result.map_err(Stop::from_log)
            }
            _ = self.ctx.step_down.interrupted() => Err(Stop::SteppedDown),
        };
        self.set_blocked(None);
        result
    }

    async fn suspend(&self, point: SuspensionPoint) -> Result<(), Stop> {
        if self.ctx.step_down.is_interrupted() {
            return Err(Stop::SteppedDown);
        }

        self.set_blocked(Some(BlockedOn::SuspensionPoint(point)));
        let outcome = tokio::select! {
            outcome = self.ctx.hooks.on(point, self.txn) => outcome,
            _ = self.ctx.step_down.interrupted() => return Err(Stop::SteppedDown),
        };
        self.set_blocked(None);

        match outcome {
            HookOutcome::Continue => Ok(()),
            HookOutcome::Crash => Err(Stop::Crashed(point)),
        }
    }

    fn take_abort_request(&self) -> Option<AbortReason> {
        let mut request = self.abort_request.lock();
        match std::mem::replace(&mut *request, AbortRequest::Taken) {
            AbortRequest::Pending(reason) => Some(reason),
            previous => {
                *request = previous;
                None
            }
        }
    }

    async fn abort_requested(&self) -> AbortReason {
        loop {
            let notified = self.abort_requested.notified();
            if let Some(reason) = self.take_abort_request() {
                return reason;
            }
            notified.await;
        }
    }

    /// Enter Deciding and consume any abort request that raced with the votes
    fn enter_deciding(&self) -> Option<AbortReason> {
        let now = self.ctx.clock.now();
        let mut progress = self.progress.lock();
        let previous = std::mem::replace(&mut progress.stage, CoordinatorStage::Deciding);
        progress
            .stage_started
            .entry(CoordinatorStage::Deciding)
            .or_insert(now);
        let requested = self.take_abort_request();
        drop(progress);

        self.ctx
            .metrics
            .stage_changed(previous, CoordinatorStage::Deciding);
        requested
    }

    fn set_stage(&self, stage: CoordinatorStage) {
        let now = self.ctx.clock.now();
        let mut progress = self.progress.lock();
        let previous = std::mem::replace(&mut progress.stage, stage);
        progress.stage_started.entry(stage).or_insert(now);
        drop(progress);

        self.ctx.metrics.stage_changed(previous, stage);
        tracing::debug!(txn = %self.txn, ?previous, ?stage, "Coordinator stage changed");
    }

    fn set_blocked(&self, blocked_on: Option<BlockedOn>) {
        self.progress.lock().blocked_on = blocked_on;
    }

    /// Mirror progress into the session's transaction record, if it is
    /// still there
    fn update_record(
        &self,
        f: impl FnOnce(&mut TransactionRecord) -> shardtx_session::Result<()>,
    ) {
        match self.ctx.catalog.with_record(self.txn, f) {
            Ok(()) | Err(SessionError::NoSuchTransaction(_)) => {}
            Err(e) => tracing::warn!(txn = %self.txn, "Failed to update transaction record: {}", e),
        }
    }
}

impl std::fmt::Debug for TwoPhaseCommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoPhaseCommitCoordinator")
            .field("txn", &self.txn)
            .field("stage", &self.stage())
            .finish()
    }
}

/// Send prepare until the participant answers. Unreachable participants are
/// retried; the caller bounds the whole exchange with the vote timeout.
async fn request_vote(
    ctx: &CoordinatorContext,
    participant: &ParticipantId,
    txn: TxnId,
) -> Result<PrepareVote, TransportError> {
    let mut backoff = ctx.config.decision_retry.backoff();
    loop {
        let result = ctx.transport.send_prepare(participant, txn).await;
        if let Err(TransportError::Unreachable(_)) = &result
            && backoff.wait().await
        {
            continue;
        }
        return result;
    }
}
