//! Session catalog: exclusive checkout of sessions and their transaction records
//!
//! At most one operation runs on a session at a time. Other callers wait
//! cooperatively until the holder checks the session back in. Killing a session
//! interrupts its current operation and fails anyone still waiting; the holder
//! observes the interrupt at its next check point and still checks in normally.

use crate::config::CatalogConfig;
use crate::error::{Result, SessionError};
use crate::record::TransactionRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardtx_clock::OpTime;
use shardtx_common::{AbortReason, Interrupt, SessionId, TxnId, TxnNumber, TxnState};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

struct SessionSlot {
    /// Id of the current checkout, if any
    holder: Option<u64>,
    /// Bumped on every kill; waiters that see it change give up
    kill_generation: u64,
    current_op: Option<Interrupt>,
    /// Latest transaction attempt on this session
    record: Option<TransactionRecord>,
    last_used: Instant,
    released: Arc<Notify>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            holder: None,
            kill_generation: 0,
            current_op: None,
            record: None,
            last_used: Instant::now(),
            released: Arc::new(Notify::new()),
        }
    }

    fn has_open_transaction(&self) -> bool {
        self.record
            .as_ref()
            .is_some_and(|record| !record.state().is_terminal())
    }
}

/// Per-session result of [`SessionCatalog::kill`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillOutcome {
    pub session_id: SessionId,
    /// The session itself and any child sessions that were killed
    pub killed_sessions: Vec<SessionId>,
    /// Running operations that were signalled
    pub interrupted_operations: usize,
}

impl KillOutcome {
    pub fn found(&self) -> bool {
        !self.killed_sessions.is_empty()
    }
}

/// Monitoring view of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub checked_out: bool,
    pub transaction: Option<TransactionRecord>,
}

struct CatalogInner {
    config: CatalogConfig,
    slots: Mutex<HashMap<SessionId, SessionSlot>>,
    /// Last txn number of each reaped session. Locked only while holding
    /// `slots`.
    retired: Mutex<HashMap<SessionId, TxnNumber>>,
    next_checkout: AtomicU64,
}

/// Process-wide table of live sessions. Clones share the same table.
#[derive(Clone)]
pub struct SessionCatalog {
    inner: Arc<CatalogInner>,
}

impl SessionCatalog {
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                config,
                slots: Mutex::new(HashMap::new()),
                retired: Mutex::new(HashMap::new()),
                next_checkout: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.inner.config
    }

    /// Check out a session, waiting while another operation holds it.
    ///
    /// Fails with [`SessionError::SessionConflict`] if the session is killed
    /// while this caller is waiting.
    pub async fn check_out(&self, session_id: SessionId) -> Result<SessionCheckout> {
        let mut seen_generation = None;

        loop {
            let released: Arc<Notify>;
            let notified;
            {
                let mut slots = self.inner.slots.lock();
                let slot = slots.entry(session_id).or_insert_with(SessionSlot::new);

                if let Some(generation) = seen_generation
                    && slot.kill_generation != generation
                {
                    return Err(SessionError::SessionConflict(session_id));
                }

                if slot.holder.is_none() {
                    let checkout_id = self.inner.next_checkout.fetch_add(1, Ordering::Relaxed);
                    let interrupt = Interrupt::new();
                    slot.holder = Some(checkout_id);
                    slot.current_op = Some(interrupt.clone());
                    slot.last_used = Instant::now();

                    return Ok(SessionCheckout {
                        catalog: self.clone(),
                        session_id,
                        checkout_id,
                        interrupt,
                        checked_in: false,
                    });
                }

                seen_generation = Some(slot.kill_generation);
                released = slot.released.clone();
                // Registered under the lock so a check-in cannot slip past us
                notified = released.notified();
            }

            tracing::debug!(%session_id, "Waiting for session to be checked in");
            notified.await;
        }
    }

    fn release(&self, session_id: SessionId, checkout_id: u64) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(&session_id)
            && slot.holder == Some(checkout_id)
        {
            slot.holder = None;
            slot.current_op = None;
            slot.last_used = Instant::now();
            slot.released.notify_waiters();
        }
    }

    /// Kill a session and its child sessions.
    ///
    /// Interrupts their running operations and fails their waiters. Transaction
    /// records are left alone.
    pub fn kill(&self, session_id: SessionId) -> KillOutcome {
        let mut slots = self.inner.slots.lock();
        let mut killed_sessions = Vec::new();
        let mut interrupted_operations = 0;

        for (id, slot) in slots.iter_mut() {
            if !id.belongs_to(&session_id) {
                continue;
            }
            slot.kill_generation += 1;
            if let Some(op) = &slot.current_op {
                op.interrupt();
                interrupted_operations += 1;
            }
            slot.released.notify_waiters();
            killed_sessions.push(*id);
        }
        killed_sessions.sort();

        tracing::info!(
            %session_id,
            sessions = killed_sessions.len(),
            interrupted_operations,
            "Killed session"
        );

        KillOutcome {
            session_id,
            killed_sessions,
            interrupted_operations,
        }
    }

    /// Interrupt the operation currently running on `session_id` without
    /// killing the session. Returns false if nothing was running.
    pub fn interrupt_operation(&self, session_id: SessionId) -> bool {
        let slots = self.inner.slots.lock();
        match slots.get(&session_id).and_then(|slot| slot.current_op.as_ref()) {
            Some(op) => {
                op.interrupt();
                true
            }
            None => false,
        }
    }

    pub fn is_checked_out(&self, session_id: SessionId) -> bool {
        self.inner
            .slots
            .lock()
            .get(&session_id)
            .is_some_and(|slot| slot.holder.is_some())
    }

    /// Start attempt `txn_number` on the checked-out session.
    ///
    /// An older attempt that is still in progress is aborted and returned so
    /// the caller can release its participants. A prepared attempt, or one
    /// whose commit has begun, blocks the start.
    pub fn start_transaction(
        &self,
        checkout: &SessionCheckout,
        txn_number: TxnNumber,
        start_op_time: OpTime,
    ) -> Result<Option<TransactionRecord>> {
        let session_id = checkout.session_id;
        let txn = TxnId::new(session_id, txn_number);

        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(&session_id)
            .filter(|slot| slot.holder == Some(checkout.checkout_id))
            .ok_or(SessionError::SessionConflict(session_id))?;

        if slot.record.is_none()
            && let Some(last) = self.inner.retired.lock().get(&session_id).copied()
            && txn_number <= last
        {
            return Err(SessionError::TransactionNumberTooOld {
                session: session_id,
                requested: txn_number,
                last,
            });
        }

        let mut superseded = None;
        if let Some(existing) = slot.record.as_mut() {
            let last = existing.txn().txn_number;

            if txn_number < last || (txn_number == last && existing.state().is_terminal()) {
                return Err(SessionError::TransactionNumberTooOld {
                    session: session_id,
                    requested: txn_number,
                    last,
                });
            }
            if txn_number == last {
                return Err(SessionError::TransactionInProgress(txn));
            }

            match existing.state() {
                TxnState::Prepared => {
                    return Err(SessionError::PreparedTransactionInProgress(existing.txn()));
                }
                TxnState::InProgress if existing.commit_started() => {
                    return Err(SessionError::PreparedTransactionInProgress(existing.txn()));
                }
                TxnState::InProgress => {
                    existing.abort(AbortReason::Superseded { by: txn_number }, start_op_time)?;
                    tracing::info!(
                        superseded = %existing.txn(),
                        by = %txn_number,
                        "Superseded in-progress transaction"
                    );
                    superseded = Some(existing.clone());
                }
                TxnState::Committed | TxnState::Aborted => {}
            }
        }

        slot.record = Some(TransactionRecord::new(txn, start_op_time));
        slot.last_used = Instant::now();
        self.inner.retired.lock().remove(&session_id);
        Ok(superseded)
    }

    /// Run `f` against the record for `txn`.
    ///
    /// Does not require a checkout: the coordinator's background work uses it to
    /// publish progress even after the client has gone away.
    pub fn with_record<R>(
        &self,
        txn: TxnId,
        f: impl FnOnce(&mut TransactionRecord) -> Result<R>,
    ) -> Result<R> {
        let mut slots = self.inner.slots.lock();
        let record = slots
            .get_mut(&txn.session_id)
            .and_then(|slot| slot.record.as_mut())
            .filter(|record| record.txn() == txn)
            .ok_or(SessionError::NoSuchTransaction(txn))?;
        f(record)
    }

    /// Move the record for `txn` to `state`
    pub fn publish_state(&self, txn: TxnId, state: TxnState, at: OpTime) -> Result<()> {
        self.with_record(txn, |record| record.transition(state, at))
    }

    pub fn record_snapshot(&self, txn: TxnId) -> Option<TransactionRecord> {
        self.inner
            .slots
            .lock()
            .get(&txn.session_id)
            .and_then(|slot| slot.record.as_ref())
            .filter(|record| record.txn() == txn)
            .cloned()
    }

    /// Latest attempt on a session, whatever its number
    pub fn current_record(&self, session_id: SessionId) -> Option<TransactionRecord> {
        self.inner
            .slots
            .lock()
            .get(&session_id)
            .and_then(|slot| slot.record.clone())
    }

    /// Drop idle sessions. A session is idle when it is not checked out, has no
    /// open transaction and was last used longer ago than the idle timeout.
    ///
    /// The last txn number of a reaped session is kept, so older numbers stay
    /// refused when the session comes back.
    pub fn reap_idle(&self, now: Instant) -> Vec<SessionId> {
        let timeout = self.inner.config.idle_session_timeout;
        let mut slots = self.inner.slots.lock();

        let mut reaped: Vec<SessionId> = slots
            .iter()
            .filter(|(_, slot)| {
                slot.holder.is_none()
                    && !slot.has_open_transaction()
                    && now.saturating_duration_since(slot.last_used) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();

        let mut retired = self.inner.retired.lock();
        for id in &reaped {
            if let Some(record) = slots.remove(id).and_then(|slot| slot.record) {
                retired.insert(*id, record.txn().txn_number);
            }
        }
        drop(retired);
        reaped.sort();

        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "Reaped idle sessions");
        }
        reaped
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let slots = self.inner.slots.lock();
        let mut sessions: Vec<SessionSnapshot> = slots
            .iter()
            .map(|(id, slot)| SessionSnapshot {
                session_id: *id,
                checked_out: slot.holder.is_some(),
                transaction: slot.record.clone(),
            })
            .collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionCatalog {
    fn default() -> Self {
        Self::new(CatalogConfig::default())
    }
}

/// Exclusive hold on a session. Checked back in when dropped.
pub struct SessionCheckout {
    catalog: SessionCatalog,
    session_id: SessionId,
    checkout_id: u64,
    interrupt: Interrupt,
    checked_in: bool,
}

impl SessionCheckout {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Fires when the session is killed or the operation is interrupted
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn check_interrupted(&self) -> Result<()> {
        self.interrupt.check()?;
        Ok(())
    }

    pub fn check_in(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.checked_in {
            self.checked_in = true;
            self.catalog.release(self.session_id, self.checkout_id);
        }
    }
}

impl Drop for SessionCheckout {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SessionCheckout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCheckout")
            .field("session_id", &self.session_id)
            .field("checkout_id", &self.checkout_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ts(n: u64) -> OpTime {
        OpTime::new(n, 0)
    }

    #[tokio::test]
    async fn test_start_transaction_numbering() {
        let catalog = SessionCatalog::default();
        let session = SessionId::new();
        let checkout = catalog.check_out(session).await.unwrap();

        catalog.start_transaction(&checkout, 5.into(), ts(1)).unwrap();
        assert_eq!(
            catalog.start_transaction(&checkout, 5.into(), ts(2)),
            Err(SessionError::TransactionInProgress(TxnId::new(session, 5)))
        );
        assert!(matches!(
            catalog.start_transaction(&checkout, 4.into(), ts(2)),
            Err(SessionError::TransactionNumberTooOld { .. })
        ));

        let txn = TxnId::new(session, 5);
        catalog
            .publish_state(txn, TxnState::Aborted, ts(3))
            .unwrap();
        assert!(matches!(
            catalog.start_transaction(&checkout, 5.into(), ts(4)),
            Err(SessionError::TransactionNumberTooOld { .. })
        ));
        assert_eq!(catalog.start_transaction(&checkout, 6.into(), ts(4)), Ok(None));
    }

    #[tokio::test]
    async fn test_newer_attempt_supersedes_in_progress() {
        let catalog = SessionCatalog::default();
        let session = SessionId::new();
        let checkout = catalog.check_out(session).await.unwrap();

        catalog.start_transaction(&checkout, 1.into(), ts(1)).unwrap();
        let superseded = catalog
            .start_transaction(&checkout, 3.into(), ts(2))
            .unwrap()
            .expect("attempt 1 superseded");

        assert_eq!(superseded.state(), TxnState::Aborted);
        assert_eq!(
            superseded.abort_reason(),
            Some(&AbortReason::Superseded { by: 3.into() })
        );
        assert!(catalog.record_snapshot(TxnId::new(session, 1)).is_none());
        assert_eq!(
            catalog
                .record_snapshot(TxnId::new(session, 3))
                .unwrap()
                .state(),
            TxnState::InProgress
        );
    }

    #[tokio::test]
    async fn test_prepared_attempt_cannot_be_superseded() {
        let catalog = SessionCatalog::default();
        let session = SessionId::new();
        let checkout = catalog.check_out(session).await.unwrap();
        let txn = TxnId::new(session, 1);

        catalog.start_transaction(&checkout, 1.into(), ts(1)).unwrap();
        catalog.publish_state(txn, TxnState::Prepared, ts(2)).unwrap();

        assert_eq!(
            catalog.start_transaction(&checkout, 2.into(), ts(3)),
            Err(SessionError::PreparedTransactionInProgress(txn))
        );
    }

    #[tokio::test]
    async fn test_reap_idle_keeps_open_transactions() {
        let catalog = SessionCatalog::new(CatalogConfig::for_testing());
        let idle = SessionId::new();
        let open = SessionId::new();

        catalog.check_out(idle).await.unwrap().check_in();
        {
            let checkout = catalog.check_out(open).await.unwrap();
            catalog.start_transaction(&checkout, 1.into(), ts(1)).unwrap();
        }

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(catalog.reap_idle(later), vec![idle]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.current_record(open).is_some());
    }

    #[tokio::test]
    async fn test_reaped_session_remembers_last_txn_number() {
        let catalog = SessionCatalog::new(CatalogConfig::for_testing());
        let session = SessionId::new();
        {
            let checkout = catalog.check_out(session).await.unwrap();
            catalog.start_transaction(&checkout, 5.into(), ts(1)).unwrap();
        }
        catalog
            .publish_state(TxnId::new(session, 5), TxnState::Committed, ts(2))
            .unwrap();

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(catalog.reap_idle(later), vec![session]);
        assert!(catalog.is_empty());

        let checkout = catalog.check_out(session).await.unwrap();
        assert_eq!(
            catalog.start_transaction(&checkout, 4.into(), ts(3)),
            Err(SessionError::TransactionNumberTooOld {
                session,
                requested: 4.into(),
                last: 5.into(),
            })
        );
        assert!(matches!(
            catalog.start_transaction(&checkout, 5.into(), ts(3)),
            Err(SessionError::TransactionNumberTooOld { .. })
        ));
        assert_eq!(catalog.start_transaction(&checkout, 6.into(), ts(3)), Ok(None));
    }

    #[tokio::test]
    async fn test_interrupt_operation_does_not_kill() {
        let catalog = SessionCatalog::default();
        let session = SessionId::new();
        let checkout = catalog.check_out(session).await.unwrap();

        assert!(catalog.interrupt_operation(session));
        assert_eq!(checkout.check_interrupted(), Err(SessionError::Interrupted));
        checkout.check_in();

        assert!(!catalog.interrupt_operation(session));
        let again = catalog.check_out(session).await.unwrap();
        assert!(again.check_interrupted().is_ok());
    }
}
