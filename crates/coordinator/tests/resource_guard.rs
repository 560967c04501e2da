//! Resource pressure, lifetime limits and idle session reaping

mod common;

use common::{Cluster, doc, eventually, put, within};
use shardtx_common::{AbortReason, ErrorCode, SessionId, TxnState};
use shardtx_coordinator::{
    CacheBudget, CoordinatorConfig, CoordinatorError, PressurePass, ResourceGuard,
    SuspensionPoint, TicketPool,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_idle_transaction_goes_before_active_one() {
    let cluster = Cluster::new(&["shard-a"]);
    let older = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    older.execute("shard-a", put("x", doc(1))).await.unwrap();
    let newer = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    newer.execute("shard-a", put("y", doc(1))).await.unwrap();

    // An operation is running on the newer transaction's session
    let running = cluster.catalog.check_out(newer.session_id()).await.unwrap();

    let guard = ResourceGuard::new(cluster.service.clone());
    assert_eq!(
        guard.on_resource_pressure(PressurePass::Soft, "write tickets"),
        Some(older.txn())
    );
    assert_eq!(
        cluster.catalog.record_snapshot(older.txn()).unwrap().state(),
        TxnState::Aborted
    );

    // Nothing else is idle, so a second soft pass leaves the active one alone
    assert_eq!(
        guard.on_resource_pressure(PressurePass::Soft, "write tickets"),
        None
    );
    assert!(!running.interrupt().is_interrupted());

    assert_eq!(
        guard.on_resource_pressure(PressurePass::Hard, "write tickets"),
        Some(newer.txn())
    );
    assert!(running.interrupt().is_interrupted());
    running.check_in();

    let err = within(older.commit()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::WriteConflict);
    assert!(matches!(
        err,
        CoordinatorError::TransactionAborted {
            reason: AbortReason::ResourcePressure { .. },
            ..
        }
    ));

    cluster.service.wait_for_coordinators().await;
    let shard = cluster.shard("shard-a");
    assert_eq!(shard.txn_state(older.txn()), Some(TxnState::Aborted));
    assert_eq!(shard.txn_state(newer.txn()), Some(TxnState::Aborted));
    assert!(shard.locks_held_by(older.txn()).is_empty());
}

#[tokio::test]
async fn test_equal_start_times_break_ties_by_session() {
    let cluster = Cluster::new(&["shard-a"]);
    let start = cluster.clock.now();

    let mut sessions = vec![SessionId::new(), SessionId::new(), SessionId::new()];
    for session in &sessions {
        let checkout = cluster.catalog.check_out(*session).await.unwrap();
        cluster
            .catalog
            .start_transaction(&checkout, 1u64.into(), start)
            .unwrap();
    }
    sessions.sort();

    let guard = ResourceGuard::new(cluster.service.clone());
    for session in sessions {
        let victim = guard
            .on_resource_pressure(PressurePass::Soft, "cache")
            .unwrap();
        assert_eq!(victim.session_id, session);
    }
    assert_eq!(guard.on_resource_pressure(PressurePass::Soft, "cache"), None);
}

#[tokio::test]
async fn test_pressure_escalates_after_repeated_polls() {
    let cluster = Cluster::new(&["shard-a"]);
    let txn = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    txn.execute("shard-a", put("x", doc(1))).await.unwrap();
    let running = cluster.catalog.check_out(txn.session_id()).await.unwrap();

    let cache = Arc::new(CacheBudget::new("cache", 1024));
    cache.charge(4096);
    let guard = ResourceGuard::new(cluster.service.clone()).with_monitor(cache.clone());

    // for_testing escalates after two pressured polls
    for _ in 0..2 {
        let report = guard.poll();
        assert_eq!(report.pressure.as_deref(), Some("cache"));
        assert_eq!(report.pass, Some(PressurePass::Soft));
        assert_eq!(report.sacrificed, None);
    }

    let report = guard.poll();
    assert_eq!(report.pass, Some(PressurePass::Hard));
    assert_eq!(report.sacrificed, Some(txn.txn()));
    assert!(running.interrupt().is_interrupted());
    drop(running);

    // Relieved pressure resets the escalation
    cache.release(4096);
    let report = guard.poll();
    assert_eq!(report.pressure, None);
    assert_eq!(report.pass, None);

    cache.charge(4096);
    assert_eq!(guard.poll().pass, Some(PressurePass::Soft));
}

#[tokio::test]
async fn test_operation_after_forced_abort_fails() {
    let cluster = Cluster::new(&["shard-a"]);
    let txn = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    txn.execute("shard-a", put("x", doc(1))).await.unwrap();

    let guard = ResourceGuard::new(cluster.service.clone());
    assert_eq!(
        guard.on_resource_pressure(PressurePass::Hard, "cache"),
        Some(txn.txn())
    );

    let err = txn.execute("shard-a", put("y", doc(2))).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::TransactionAborted {
            reason: AbortReason::ResourcePressure { .. },
            ..
        }
    ));
    assert_eq!(cluster.shard("shard-a").get("y"), None);
}

#[tokio::test]
async fn test_ticket_shortage_sacrifices_idle_transaction() {
    let cluster = Cluster::new(&["shard-a"]);
    let txn = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    txn.execute("shard-a", put("x", doc(1))).await.unwrap();

    let pool = TicketPool::new("write tickets", 1);
    let guard = ResourceGuard::new(cluster.service.clone());
    let held = guard.try_acquire(&pool).unwrap();

    assert!(guard.try_acquire(&pool).is_none());
    assert_eq!(
        cluster.catalog.record_snapshot(txn.txn()).unwrap().state(),
        TxnState::Aborted
    );

    drop(held);
    assert!(guard.try_acquire(&pool).is_some());
}

#[tokio::test]
async fn test_prepared_transaction_is_never_sacrificed() {
    let config = CoordinatorConfig::for_testing().with_vote_timeout(Duration::from_secs(10));
    let cluster = Cluster::with_config(config, &["shard-a", "shard-b"]);
    let txn = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    txn.execute("shard-a", put("x", doc(1))).await.unwrap();
    txn.execute("shard-b", put("y", doc(1))).await.unwrap();

    // Hold the decision until the guard has had its chance
    let mut pause = cluster
        .service
        .hooks()
        .pause_at(SuspensionPoint::BeforeWritingDecision);
    let commit = tokio::spawn({
        let txn = txn.clone();
        async move { txn.commit().await }
    });
    assert_eq!(within(pause.reached()).await, Some(txn.txn()));

    let guard = ResourceGuard::new(cluster.service.clone());
    assert_eq!(guard.on_resource_pressure(PressurePass::Hard, "cache"), None);

    pause.release();
    let result = within(commit).await.unwrap().unwrap();
    assert!(result.commit_timestamp.is_some());
}

#[tokio::test]
async fn test_lifetime_limit_aborts_old_transactions() {
    let config =
        CoordinatorConfig::for_testing().with_transaction_lifetime_limit(Duration::from_millis(20));
    let cluster = Cluster::with_config(config, &["shard-a"]);
    let txn = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    txn.execute("shard-a", put("x", doc(1))).await.unwrap();

    let guard = ResourceGuard::new(cluster.service.clone());
    assert!(guard.poll().expired.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(guard.poll().expired, vec![txn.txn()]);

    let err = within(txn.commit()).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::TransactionAborted {
            reason: AbortReason::LifetimeExpired,
            ..
        }
    ));
}

#[tokio::test]
async fn test_idle_sessions_are_reaped() {
    let cluster = Cluster::new(&["shard-a"]);
    let finished = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    finished.commit().await.unwrap();
    let open = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();

    // CatalogConfig::for_testing reaps after 100ms
    tokio::time::sleep(Duration::from_millis(150)).await;
    let guard = ResourceGuard::new(cluster.service.clone());
    let report = guard.poll();

    assert_eq!(report.reaped_sessions, vec![finished.session_id()]);
    assert!(cluster.catalog.current_record(open.session_id()).is_some());
}

#[tokio::test]
async fn test_background_guard_relieves_pressure() {
    let cluster = Cluster::new(&["shard-a"]);
    let txn = cluster
        .service
        .begin_transaction(SessionId::new(), 1u64)
        .await
        .unwrap();
    txn.execute("shard-a", put("x", doc(1))).await.unwrap();

    let cache = Arc::new(CacheBudget::new("cache", 0));
    let guard = Arc::new(ResourceGuard::new(cluster.service.clone()).with_monitor(cache));
    guard.start();

    let catalog = cluster.catalog.clone();
    let id = txn.txn();
    eventually(|| {
        catalog
            .record_snapshot(id)
            .is_some_and(|record| record.state() == TxnState::Aborted)
    })
    .await;

    guard.stop().await;
}
