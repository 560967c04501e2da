//! Cooperative interruption tokens
//!
//! An operation holding an [`Interrupt`] observes interruption at its next
//! check point; nothing is cancelled synchronously.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Returned by [`Interrupt::check`] once the token has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[derive(Default)]
struct InterruptInner {
    fired: AtomicBool,
    notify: Notify,
}

/// Shared, clonable interruption flag.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Idempotent.
    pub fn interrupt(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolve once the token fires.
    pub async fn interrupted(&self) {
        loop {
            // Register before checking so a concurrent interrupt is not missed
            let notified = self.inner.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("fired", &self.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_wakes_waiter() {
        let token = Interrupt::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.interrupted().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(token.check().is_ok());

        token.interrupt();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();

        assert_eq!(token.check(), Err(Interrupted));
    }

    #[tokio::test]
    async fn test_already_fired_resolves_immediately() {
        let token = Interrupt::new();
        token.interrupt();
        token.interrupt();

        tokio::time::timeout(Duration::from_millis(100), token.interrupted())
            .await
            .expect("fired token resolves at once");
    }
}
