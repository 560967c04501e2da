//! Bounded retries for transient log write failures

use crate::error::{LogError, Result};
use shardtx_common::{RetryPolicy, TxnId};
use std::future::Future;

/// Run `write` until it succeeds, fails permanently, or `policy` runs out.
///
/// Only [`LogError::is_transient`] failures are retried. Exhaustion is reported
/// as [`LogError::RetriesExhausted`] wrapping the last failure.
pub async fn persist_with_retry<F, Fut>(
    policy: &RetryPolicy,
    what: &'static str,
    txn: TxnId,
    mut write: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut backoff = policy.backoff();

    loop {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(%txn, attempt = backoff.attempts(), "Failed to {}: {}", what, e);

                if !backoff.wait().await {
                    return Err(LogError::RetriesExhausted {
                        what,
                        txn,
                        attempts: backoff.attempts(),
                        source: Box::new(e),
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DurableLog, MemoryTransactionLog};
    use shardtx_common::{ParticipantId, SessionId};
    use std::time::Duration;

    #[tokio::test]
    async fn test_retries_through_transient_failures() {
        let log = MemoryTransactionLog::new();
        let txn = TxnId::new(SessionId::new(), 1);
        let participants = vec![ParticipantId::from("shard-a")];

        log.fail_next_writes(3);
        persist_with_retry(&RetryPolicy::for_testing(), "persist participants", txn, || {
            log.persist_participant_list(txn, &participants)
        })
        .await
        .unwrap();

        assert!(log.read(txn).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gives_up_after_policy_is_exhausted() {
        let log = MemoryTransactionLog::new();
        let txn = TxnId::new(SessionId::new(), 1);
        let participants = vec![ParticipantId::from("shard-a")];

        log.fail_next_writes(100);
        let policy = RetryPolicy::bounded(3).with_initial_backoff(Duration::from_millis(1));
        let err = persist_with_retry(&policy, "persist participants", txn, || {
            log.persist_participant_list(txn, &participants)
        })
        .await
        .unwrap_err();

        match err {
            LogError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }
        assert!(log.read(txn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let log = MemoryTransactionLog::new();
        let txn = TxnId::new(SessionId::new(), 1);

        log.persist_participant_list(txn, &[ParticipantId::from("shard-a")])
            .await
            .unwrap();

        let conflicting = vec![ParticipantId::from("shard-z")];
        let err = persist_with_retry(&RetryPolicy::for_testing(), "persist participants", txn, || {
            log.persist_participant_list(txn, &conflicting)
        })
        .await
        .unwrap_err();

        assert!(err.is_fatal());
    }
}
