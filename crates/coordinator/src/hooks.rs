//! Named suspension points in the coordinator's state machine
//!
//! Tests install a pause or a simulated crash at a point; every coordinator
//! that reaches it then waits for release or stops dead, leaving the durable
//! log exactly as a real crash at that step would.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardtx_common::TxnId;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, watch};

/// Steps where a coordinator may be held or stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SuspensionPoint {
    BeforeWritingParticipantList,
    BeforeSendingPrepare,
    BeforeWritingDecision,
    BeforeSendingDecision,
    BeforeMarkingCollectable,
}

impl fmt::Display for SuspensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone)]
enum HookAction {
    Pause {
        reached: mpsc::UnboundedSender<TxnId>,
        released: watch::Receiver<bool>,
    },
    Crash,
}

/// What the coordinator does after passing a suspension point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookOutcome {
    Continue,
    Crash,
}

/// Hooks shared by every coordinator of one service
#[derive(Default)]
pub struct CoordinatorHooks {
    actions: Mutex<HashMap<SuspensionPoint, HookAction>>,
}

impl CoordinatorHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every coordinator that reaches `point` until the handle is
    /// released or dropped.
    pub fn pause_at(&self, point: SuspensionPoint) -> PauseHandle {
        let (reached_tx, reached_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = watch::channel(false);

        self.actions.lock().insert(
            point,
            HookAction::Pause {
                reached: reached_tx,
                released: release_rx,
            },
        );

        PauseHandle {
            point,
            reached: reached_rx,
            release: release_tx,
        }
    }

    /// Stop every coordinator that reaches `point` without further side
    /// effects, as if the process died there.
    pub fn crash_at(&self, point: SuspensionPoint) {
        self.actions.lock().insert(point, HookAction::Crash);
    }

    pub fn clear(&self, point: SuspensionPoint) {
        self.actions.lock().remove(&point);
    }

    pub(crate) async fn on(&self, point: SuspensionPoint, txn: TxnId) -> HookOutcome {
        let action = self.actions.lock().get(&point).cloned();

        match action {
            None => HookOutcome::Continue,
            Some(HookAction::Crash) => {
                tracing::warn!(%txn, %point, "Coordinator stopped at crash point");
                HookOutcome::Crash
            }
            Some(HookAction::Pause {
                reached,
                mut released,
            }) => {
                tracing::debug!(%txn, %point, "Coordinator paused");
                let _ = reached.send(txn);
                // A dropped handle releases the pause
                while !*released.borrow_and_update() {
                    if released.changed().await.is_err() {
                        break;
                    }
                }
                HookOutcome::Continue
            }
        }
    }
}

/// Test-side end of a pause installed with [`CoordinatorHooks::pause_at`]
pub struct PauseHandle {
    point: SuspensionPoint,
    reached: mpsc::UnboundedReceiver<TxnId>,
    release: watch::Sender<bool>,
}

impl PauseHandle {
    pub fn point(&self) -> SuspensionPoint {
        self.point
    }

    /// Wait for the next coordinator to arrive at the point
    pub async fn reached(&mut self) -> Option<TxnId> {
        self.reached.recv().await
    }

    /// Let every held coordinator continue. Later arrivals pass straight
    /// through.
    pub fn release(&self) {
        self.release.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardtx_common::SessionId;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pause_holds_until_released() {
        let hooks = Arc::new(CoordinatorHooks::new());
        let mut pause = hooks.pause_at(SuspensionPoint::BeforeWritingDecision);
        let txn = TxnId::new(SessionId::new(), 1);

        let task = {
            let hooks = hooks.clone();
            tokio::spawn(
                async move { hooks.on(SuspensionPoint::BeforeWritingDecision, txn).await },
            )
        };

        assert_eq!(pause.reached().await, Some(txn));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        pause.release();
        assert_eq!(task.await.unwrap(), HookOutcome::Continue);
    }

    #[tokio::test]
    async fn test_crash_and_clear() {
        let hooks = CoordinatorHooks::new();
        let txn = TxnId::new(SessionId::new(), 1);

        hooks.crash_at(SuspensionPoint::BeforeSendingPrepare);
        assert_eq!(
            hooks.on(SuspensionPoint::BeforeSendingPrepare, txn).await,
            HookOutcome::Crash
        );
        assert_eq!(
            hooks.on(SuspensionPoint::BeforeSendingDecision, txn).await,
            HookOutcome::Continue
        );

        hooks.clear(SuspensionPoint::BeforeSendingPrepare);
        assert_eq!(
            hooks.on(SuspensionPoint::BeforeSendingPrepare, txn).await,
            HookOutcome::Continue
        );
    }
}
