//! Shared setup for recovery integration tests

#![allow(dead_code)]

use serde_json::{Value, json};
use shardtx_clock::{OpTimeClock, SharedClock};
use shardtx_coordinator::{CoordinatorConfig, TransactionCoordinatorService};
use shardtx_log::DurableLog;
use shardtx_participant::{InProcessTransport, LocalShard, ShardOperation};
use shardtx_session::{CatalogConfig, SessionCatalog};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Shards shared by every coordinator node of a test
pub struct Shards {
    pub transport: Arc<InProcessTransport>,
    pub clock: SharedClock,
}

impl Shards {
    pub fn new(ids: &[&str]) -> Self {
        let clock: SharedClock = Arc::new(OpTimeClock::new());
        let transport = Arc::new(InProcessTransport::new());
        for id in ids {
            transport.add_shard(Arc::new(LocalShard::new(*id, clock.clone())));
        }
        Self { transport, clock }
    }

    pub fn get(&self, id: &str) -> Arc<LocalShard> {
        self.transport
            .shard(&id.into())
            .unwrap_or_else(|| panic!("no shard {}", id))
    }

    /// Swap in a restarted shard
    pub fn replace(&self, shard: LocalShard) -> Arc<LocalShard> {
        let shard = Arc::new(shard);
        self.transport.add_shard(shard.clone());
        shard
    }

    /// A coordinator node with a fresh session catalog over `log`
    pub fn node(&self, log: Arc<dyn DurableLog>) -> TransactionCoordinatorService {
        TransactionCoordinatorService::new(
            CoordinatorConfig::for_testing(),
            SessionCatalog::new(CatalogConfig::for_testing()),
            log,
            self.transport.clone(),
            self.clock.clone(),
        )
    }
}

pub fn put(key: &str, value: Value) -> ShardOperation {
    ShardOperation::Put {
        key: key.to_string(),
        value,
    }
}

pub fn doc(n: i64) -> Value {
    json!({ "n": n })
}

/// Run `future` with a deadline so a hung coordinator fails the test
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
