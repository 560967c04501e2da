//! Coordinator counters

use crate::coordinator::CoordinatorStage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`CoordinatorMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_created: u64,
    pub total_started_two_phase_commit: u64,
    pub total_committed: u64,
    pub total_aborted: u64,
    /// Coordinators currently in each stage. Stages with none are omitted.
    pub current_in_stage: BTreeMap<CoordinatorStage, u64>,
}

impl MetricsSnapshot {
    pub fn current(&self, stage: CoordinatorStage) -> u64 {
        self.current_in_stage.get(&stage).copied().unwrap_or(0)
    }
}

/// Counters shared by the coordinators of one service
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    total_created: AtomicU64,
    total_started_two_phase_commit: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    current_in_stage: Mutex<BTreeMap<CoordinatorStage, u64>>,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn created(&self, stage: CoordinatorStage) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
        *self.current_in_stage.lock().entry(stage).or_insert(0) += 1;
    }

    pub(crate) fn started_two_phase_commit(&self) {
        self.total_started_two_phase_commit
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn committed(&self) {
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn aborted(&self) {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stage_changed(&self, from: CoordinatorStage, to: CoordinatorStage) {
        if from == to {
            return;
        }
        let mut current = self.current_in_stage.lock();
        if let Some(count) = current.get_mut(&from) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                current.remove(&from);
            }
        }
        // Finished coordinators are not tracked
        if to != CoordinatorStage::Done {
            *current.entry(to).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_started_two_phase_commit: self
                .total_started_two_phase_commit
                .load(Ordering::Relaxed),
            total_committed: self.total_committed.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            current_in_stage: self.current_in_stage.lock().clone(),
        }
    }
}
