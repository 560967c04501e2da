//! Coordinator configuration

use serde::{Deserialize, Serialize};
use shardtx_common::RetryPolicy;
use std::time::Duration;

/// Configuration for the transaction coordinator service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long to wait for all prepare votes. A missing vote counts as no.
    pub vote_timeout: Duration,

    /// Retries for delivering a decision. Decisions are delivered until
    /// acknowledged, so a bounded policy restarts from its initial backoff
    /// once exhausted.
    pub decision_retry: RetryPolicy,

    /// Retries for transient log write failures
    pub log_retry: RetryPolicy,

    /// How long a decided coordinator document stays readable for commit
    /// retries before it may be collected
    pub decision_retention: Duration,

    /// Open transactions older than this are aborted by the resource guard
    pub transaction_lifetime_limit: Duration,

    pub guard: GuardConfig,
}

/// Resource guard polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Interval between resource checks
    pub poll_interval: Duration,

    /// Consecutive polls under pressure before active transactions become
    /// candidates too
    pub escalate_after_polls: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            vote_timeout: Duration::from_secs(30),
            decision_retry: RetryPolicy::unbounded()
                .with_initial_backoff(Duration::from_millis(10))
                .with_max_backoff(Duration::from_secs(1)),
            log_retry: RetryPolicy::bounded(10),
            decision_retention: Duration::from_secs(60),
            transaction_lifetime_limit: Duration::from_secs(60),
            guard: GuardConfig::default(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            escalate_after_polls: 3,
        }
    }
}

impl CoordinatorConfig {
    /// Config optimized for testing
    pub fn for_testing() -> Self {
        Self {
            vote_timeout: Duration::from_millis(200),
            decision_retry: RetryPolicy::unbounded()
                .with_initial_backoff(Duration::from_millis(1))
                .with_max_backoff(Duration::from_millis(10)),
            log_retry: RetryPolicy::for_testing(),
            decision_retention: Duration::ZERO,
            transaction_lifetime_limit: Duration::from_secs(60),
            guard: GuardConfig {
                poll_interval: Duration::from_millis(10),
                escalate_after_polls: 2,
            },
        }
    }

    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    pub fn with_decision_retry(mut self, policy: RetryPolicy) -> Self {
        self.decision_retry = policy;
        self
    }

    pub fn with_log_retry(mut self, policy: RetryPolicy) -> Self {
        self.log_retry = policy;
        self
    }

    pub fn with_decision_retention(mut self, retention: Duration) -> Self {
        self.decision_retention = retention;
        self
    }

    pub fn with_transaction_lifetime_limit(mut self, limit: Duration) -> Self {
        self.transaction_lifetime_limit = limit;
        self
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }
}
