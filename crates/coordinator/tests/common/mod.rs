//! Shared setup for coordinator integration tests

#![allow(dead_code)]

use serde_json::{Value, json};
use shardtx_clock::{OpTimeClock, SharedClock};
use shardtx_coordinator::{CoordinatorConfig, TransactionCoordinatorService};
use shardtx_log::MemoryTransactionLog;
use shardtx_participant::{InProcessTransport, LocalShard, ShardOperation};
use shardtx_session::{CatalogConfig, SessionCatalog};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A coordinator node with in-process shards behind it
pub struct Cluster {
    pub service: TransactionCoordinatorService,
    pub catalog: SessionCatalog,
    pub log: Arc<MemoryTransactionLog>,
    pub transport: Arc<InProcessTransport>,
    pub clock: SharedClock,
}

impl Cluster {
    pub fn new(shards: &[&str]) -> Self {
        Self::with_config(CoordinatorConfig::for_testing(), shards)
    }

    pub fn with_config(config: CoordinatorConfig, shards: &[&str]) -> Self {
        let clock: SharedClock = Arc::new(OpTimeClock::new());
        let transport = Arc::new(InProcessTransport::new());
        for id in shards {
            transport.add_shard(Arc::new(LocalShard::new(*id, clock.clone())));
        }
        Self::assemble(config, Arc::new(MemoryTransactionLog::new()), transport, clock)
    }

    /// A fresh coordinator node over the same log and shards, as after a
    /// failover. Sessions are not carried over.
    pub fn failover(&self, config: CoordinatorConfig) -> Self {
        Self::assemble(
            config,
            self.log.clone(),
            self.transport.clone(),
            self.clock.clone(),
        )
    }

    fn assemble(
        config: CoordinatorConfig,
        log: Arc<MemoryTransactionLog>,
        transport: Arc<InProcessTransport>,
        clock: SharedClock,
    ) -> Self {
        let catalog = SessionCatalog::new(CatalogConfig::for_testing());
        let service = TransactionCoordinatorService::new(
            config,
            catalog.clone(),
            log.clone(),
            transport.clone(),
            clock.clone(),
        );
        Self {
            service,
            catalog,
            log,
            transport,
            clock,
        }
    }

    pub fn shard(&self, id: &str) -> Arc<LocalShard> {
        self.transport
            .shard(&id.into())
            .unwrap_or_else(|| panic!("no shard {}", id))
    }
}

pub fn put(key: &str, value: Value) -> ShardOperation {
    ShardOperation::Put {
        key: key.to_string(),
        value,
    }
}

pub fn insert(key: &str, value: Value) -> ShardOperation {
    ShardOperation::Insert {
        key: key.to_string(),
        value,
    }
}

pub fn doc(n: i64) -> Value {
    json!({ "n": n })
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Run `future` with a deadline so a hung coordinator fails the test
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
