//! Concurrent checkout, check-in and kill behaviour

use shardtx_common::SessionId;
use shardtx_session::{SessionCatalog, SessionError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_waiter_gets_session_after_check_in() {
    let catalog = SessionCatalog::default();
    let session = SessionId::new();

    let first = catalog.check_out(session).await.unwrap();

    let waiter = {
        let catalog = catalog.clone();
        tokio::spawn(async move { catalog.check_out(session).await.map(|c| c.session_id()) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(first);
    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woke up")
        .unwrap()
        .unwrap();
    assert_eq!(got, session);
}

#[tokio::test]
async fn test_only_one_holder_at_a_time() {
    let catalog = SessionCatalog::default();
    let session = SessionId::new();
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let catalog = catalog.clone();
        let holders = holders.clone();
        let max_seen = max_seen.clone();
        tasks.push(tokio::spawn(async move {
            let checkout = catalog.check_out(session).await.unwrap();
            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            checkout.check_in();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_interrupts_holder_and_fails_waiters() {
    let catalog = SessionCatalog::default();
    let session = SessionId::new();

    let holder = catalog.check_out(session).await.unwrap();
    let waiter = {
        let catalog = catalog.clone();
        tokio::spawn(async move { catalog.check_out(session).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = catalog.kill(session);
    assert!(outcome.found());
    assert_eq!(outcome.interrupted_operations, 1);

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter released by kill")
        .unwrap();
    assert_eq!(result, Err(SessionError::SessionConflict(session)));

    // The holder sees the interrupt at its next check point and still checks in
    assert_eq!(holder.check_interrupted(), Err(SessionError::Interrupted));
    holder.check_in();

    // A fresh checkout after the kill is allowed
    let again = catalog.check_out(session).await.unwrap();
    assert!(again.check_interrupted().is_ok());
}

#[tokio::test]
async fn test_killing_parent_kills_children() {
    let catalog = SessionCatalog::default();
    let parent = SessionId::new();
    let child = parent.new_child();
    let unrelated = SessionId::new();

    let child_checkout = catalog.check_out(child).await.unwrap();
    let other_checkout = catalog.check_out(unrelated).await.unwrap();
    catalog.check_out(parent).await.unwrap().check_in();

    let outcome = catalog.kill(parent);
    assert_eq!(outcome.killed_sessions.len(), 2);
    assert_eq!(outcome.interrupted_operations, 1);

    assert!(child_checkout.interrupt().is_interrupted());
    assert!(!other_checkout.interrupt().is_interrupted());
}

#[tokio::test]
async fn test_kill_unknown_session() {
    let catalog = SessionCatalog::default();
    let outcome = catalog.kill(SessionId::new());
    assert!(!outcome.found());
    assert_eq!(outcome.interrupted_operations, 0);
}

#[tokio::test]
async fn test_snapshot_reports_checkout_state() {
    let catalog = SessionCatalog::default();
    let session = SessionId::new();
    let checkout = catalog.check_out(session).await.unwrap();
    catalog
        .start_transaction(&checkout, 1.into(), shardtx_common::OpTime::new(7, 0))
        .unwrap();

    let snapshot = catalog.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].checked_out);

    let json = serde_json::to_value(&snapshot[0]).unwrap();
    assert_eq!(json["transaction"]["state"], "InProgress");
}
