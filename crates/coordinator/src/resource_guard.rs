//! Sacrificing transactions when a shared resource runs out
//!
//! Each pass aborts at most one transaction, the oldest eligible one by
//! `(start op time, session id, txn number)`. A soft pass only considers idle
//! transactions, those with no operation running on their session. If
//! pressure persists for more than `escalate_after_polls` consecutive polls,
//! hard passes consider active transactions too. Prepared transactions are
//! never eligible: only the coordinator may decide them.

use crate::config::GuardConfig;
use crate::service::TransactionCoordinatorService;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardtx_common::{AbortReason, SessionId, TxnId, TxnState};
use shardtx_session::TransactionRecord;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A resource that can run out
pub trait ResourceMonitor: Send + Sync {
    fn name(&self) -> &str;

    fn is_exhausted(&self) -> bool;
}

/// Fixed number of concurrent-operation tickets
pub struct TicketPool {
    name: String,
    permits: Arc<Semaphore>,
}

impl TicketPool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn try_acquire(&self) -> Option<Ticket> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl ResourceMonitor for TicketPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_exhausted(&self) -> bool {
        self.available() == 0
    }
}

/// A held ticket, returned to its pool on drop
pub type Ticket = OwnedSemaphorePermit;

/// Bytes of cache that open transactions may pin
pub struct CacheBudget {
    name: String,
    capacity_bytes: u64,
    used: AtomicU64,
}

impl CacheBudget {
    pub fn new(name: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            used: AtomicU64::new(0),
        }
    }

    pub fn charge(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

impl ResourceMonitor for CacheBudget {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_exhausted(&self) -> bool {
        self.used() >= self.capacity_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressurePass {
    /// Idle transactions only
    Soft,
    /// Idle and active transactions
    Hard,
}

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardReport {
    /// Transactions aborted for exceeding the lifetime limit
    pub expired: Vec<TxnId>,
    /// Exhausted resource that triggered a pass
    pub pressure: Option<String>,
    pub pass: Option<PressurePass>,
    /// Transaction aborted by the pass
    pub sacrificed: Option<TxnId>,
    pub reaped_sessions: Vec<SessionId>,
}

/// Watches resources and transaction ages for one service
pub struct ResourceGuard {
    service: TransactionCoordinatorService,
    monitors: Vec<Arc<dyn ResourceMonitor>>,
    config: GuardConfig,
    lifetime_limit: Duration,
    pressured_polls: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceGuard {
    pub fn new(service: TransactionCoordinatorService) -> Self {
        let config = service.config().guard.clone();
        let lifetime_limit = service.config().transaction_lifetime_limit;
        Self {
            service,
            monitors: Vec::new(),
            config,
            lifetime_limit,
            pressured_polls: AtomicU32::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Poll on the configured interval until stopped or dropped
    pub fn start(self: &Arc<Self>) {
        let guard: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(guard) = guard.upgrade() else {
                    break;
                };
                let report = guard.poll();
                if report.sacrificed.is_some() || !report.expired.is_empty() {
                    tracing::debug!(?report, "Resource guard acted");
                }
            }
        });

        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// One round: enforce the lifetime limit, reap idle sessions and relieve
    /// the first exhausted resource
    pub fn poll(&self) -> GuardReport {
        let mut report = GuardReport {
            expired: self.enforce_lifetime_limit(),
            reaped_sessions: self.service.catalog().reap_idle(Instant::now()),
            ..Default::default()
        };

        let Some(monitor) = self.monitors.iter().find(|m| m.is_exhausted()) else {
            self.pressured_polls.store(0, Ordering::Relaxed);
            return report;
        };

        let polls = self.pressured_polls.fetch_add(1, Ordering::Relaxed) + 1;
        let pass = if polls > self.config.escalate_after_polls {
            PressurePass::Hard
        } else {
            PressurePass::Soft
        };

        report.pressure = Some(monitor.name().to_string());
        report.pass = Some(pass);
        report.sacrificed = self.on_resource_pressure(pass, monitor.name());
        report
    }

    /// Take a ticket, running a soft pass if the pool is empty. The caller
    /// retries after a failed attempt.
    pub fn try_acquire(&self, pool: &TicketPool) -> Option<Ticket> {
        let ticket = pool.try_acquire();
        if ticket.is_none() {
            self.on_resource_pressure(PressurePass::Soft, pool.name());
        }
        ticket
    }

    /// Abort the oldest eligible transaction. Returns it, or `None` if no
    /// transaction was eligible.
    pub fn on_resource_pressure(&self, pass: PressurePass, resource: &str) -> Option<TxnId> {
        let mut candidates: Vec<TransactionRecord> = self
            .service
            .catalog()
            .snapshot()
            .into_iter()
            .filter(|session| pass == PressurePass::Hard || !session.checked_out)
            .filter_map(|session| session.transaction)
            .filter(|record| record.state() == TxnState::InProgress)
            .collect();
        candidates.sort_by_key(|record| {
            (
                record.start_op_time(),
                record.txn().session_id,
                record.txn().txn_number,
            )
        });

        for record in candidates {
            let txn = record.txn();
            let reason = AbortReason::ResourcePressure {
                resource: resource.to_string(),
            };
            if self.service.force_abort(txn, reason) {
                tracing::info!(%txn, resource, ?pass, "Aborted transaction to relieve pressure");
                return Some(txn);
            }
        }

        tracing::debug!(resource, ?pass, "No transaction eligible for abort");
        None
    }

    fn enforce_lifetime_limit(&self) -> Vec<TxnId> {
        let now = self.service.clock().now();

        let expired: Vec<TxnId> = self
            .service
            .catalog()
            .snapshot()
            .into_iter()
            .filter_map(|session| session.transaction)
            .filter(|record| {
                record.state() == TxnState::InProgress
                    && !record.commit_started()
                    && now.since(&record.start_op_time()) > self.lifetime_limit
            })
            .map(|record| record.txn())
            .collect();

        expired
            .into_iter()
            .filter(|txn| {
                self.service
                    .force_abort(*txn, AbortReason::LifetimeExpired)
            })
            .collect()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
