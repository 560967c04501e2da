//! Distributed transaction coordinator
//!
//! [`TransactionCoordinatorService`] is the client-facing surface: it starts
//! transactions on checked-out sessions, routes operations to participants and
//! hands commits to a [`TwoPhaseCommitCoordinator`]. [`ResourceGuard`] aborts
//! transactions when shared resources run out or transactions live too long.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod resource_guard;
pub mod service;

pub use config::{CoordinatorConfig, GuardConfig};
pub use coordinator::{
    BlockedOn, CoordinationOutcome, CoordinatorStage, CurrentOpEntry, TwoPhaseCommitCoordinator,
};
pub use error::{CoordinatorError, Result};
pub use hooks::{CoordinatorHooks, PauseHandle, SuspensionPoint};
pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
pub use resource_guard::{
    CacheBudget, GuardReport, PressurePass, ResourceGuard, ResourceMonitor, Ticket, TicketPool,
};
pub use service::{CommitResult, TransactionCoordinatorService, TransactionHandle};
