//! Retry policies with exponential backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

/// How often and how patiently to retry a failing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..Default::default()
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Short delays for tests
    pub fn for_testing() -> Self {
        Self {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts.map(|n| n.max(1));
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Delays between attempts: exponential from `initial_backoff`, capped at
    /// `max_backoff`, jittered, and cut off after `max_attempts - 1` retries
    pub fn backoff(&self) -> Backoff {
        let multiplier = u64::from(self.multiplier.max(1));
        let initial_millis = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let delays = ExponentialBackoff::from_millis(multiplier)
            .factor((initial_millis / multiplier).max(1))
            .max_delay(self.max_backoff)
            .map(jitter);

        let delays: Box<dyn Iterator<Item = Duration> + Send> = match self.max_attempts {
            Some(max) => Box::new(delays.take(max.saturating_sub(1) as usize)),
            None => Box::new(delays),
        };

        Backoff { delays, attempts: 1 }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

/// Retry state for one operation. The first attempt is counted on creation.
pub struct Backoff {
    delays: Box<dyn Iterator<Item = Duration> + Send>,
    attempts: u32,
}

impl Backoff {
    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once the policy is exhausted.
    /// Counts the next attempt as made.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.delays.next()?;
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Sleep before the next attempt. Returns false once the policy is
    /// exhausted, without sleeping.
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_policy_exhausts() {
        let mut backoff = RetryPolicy::bounded(3).backoff();

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_delays_stay_under_the_cap() {
        let policy = RetryPolicy::unbounded()
            .with_initial_backoff(Duration::from_millis(4))
            .with_max_backoff(Duration::from_millis(20));
        let mut backoff = policy.backoff();

        for _ in 0..50 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_millis(20));
        }
        assert_eq!(backoff.attempts(), 51);
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let mut backoff = RetryPolicy::bounded(0).backoff();
        assert!(backoff.next_delay().is_none());
    }
}
