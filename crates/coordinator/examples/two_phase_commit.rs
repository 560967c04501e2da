//! Walk through a few coordinated transactions across in-process shards
//!
//! Shows a commit, an abort forced by a no vote, and the resource guard
//! sacrificing an idle transaction. Decisions go to an on-disk log.
//!
//! Run with: RUST_LOG=debug cargo run --example two_phase_commit

use serde_json::json;
use shardtx_clock::{OpTimeClock, SharedClock};
use shardtx_common::SessionId;
use shardtx_coordinator::{
    CacheBudget, CoordinatorConfig, ResourceGuard, TransactionCoordinatorService,
};
use shardtx_log::{DurableLog, FjallTransactionLog, LogConfig};
use shardtx_participant::{InProcessTransport, LocalShard, ShardOperation};
use shardtx_session::{CatalogConfig, SessionCatalog};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let data_dir = tempfile::tempdir()?;
    let log = Arc::new(FjallTransactionLog::open(LogConfig::new(
        data_dir.path().to_path_buf(),
    ))?);

    let clock: SharedClock = Arc::new(OpTimeClock::new());
    let transport = Arc::new(InProcessTransport::new());
    for id in ["orders", "inventory"] {
        transport.add_shard(Arc::new(LocalShard::new(id, clock.clone())));
    }

    let service = TransactionCoordinatorService::new(
        CoordinatorConfig::default(),
        SessionCatalog::new(CatalogConfig::default()),
        log.clone(),
        transport.clone(),
        clock,
    );

    // 1. Both shards vote yes
    let session = SessionId::new();
    let txn = service.begin_transaction(session, 1u64).await?;
    txn.execute(
        "orders",
        ShardOperation::Insert {
            key: "order-1".to_string(),
            value: json!({ "item": "widget", "qty": 2 }),
        },
    )
    .await?;
    txn.execute(
        "inventory",
        ShardOperation::Put {
            key: "widget".to_string(),
            value: json!({ "stock": 8 }),
        },
    )
    .await?;
    let committed = txn.commit().await?;
    println!("Committed {} at {:?}", txn.txn(), committed.commit_timestamp);

    // 2. One shard votes no, so nobody commits
    if let Some(inventory) = transport.shard(&"inventory".into()) {
        inventory.faults().vote_no("stock check failed");
    }
    let txn = service.begin_transaction(session, 2u64).await?;
    txn.execute(
        "orders",
        ShardOperation::Insert {
            key: "order-2".to_string(),
            value: json!({ "item": "widget", "qty": 100 }),
        },
    )
    .await?;
    txn.execute(
        "inventory",
        ShardOperation::Put {
            key: "widget".to_string(),
            value: json!({ "stock": -92 }),
        },
    )
    .await?;
    match txn.commit().await {
        Ok(_) => println!("Unexpected commit of {}", txn.txn()),
        Err(e) => println!("Aborted {}: {} ({:?})", txn.txn(), e, e.code()),
    }
    if let Some(inventory) = transport.shard(&"inventory".into()) {
        inventory.faults().clear_vote_no();
    }

    // 3. An idle transaction is sacrificed when the cache fills up
    let idle = service.begin_transaction(SessionId::new(), 1u64).await?;
    idle.execute(
        "orders",
        ShardOperation::Put {
            key: "draft".to_string(),
            value: json!({ "note": "never finished" }),
        },
    )
    .await?;

    let cache = Arc::new(CacheBudget::new("cache", 1 << 20));
    cache.charge(2 << 20);
    let guard = ResourceGuard::new(service.clone()).with_monitor(cache);
    let report = guard.poll();
    println!("Resource guard: {}", serde_json::to_string(&report)?);

    service.wait_for_coordinators().await;
    println!("In flight: {}", serde_json::to_string_pretty(&service.current_op())?);
    println!("Metrics: {}", serde_json::to_string_pretty(&service.metrics())?);

    for doc in log.read_all().await? {
        println!(
            "Logged {}: {:?}",
            doc.txn,
            doc.decision.map(|d| d.decision)
        );
    }

    Ok(())
}
