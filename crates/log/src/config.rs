//! Transaction log configuration

use fjall::PersistMode;
use shardtx_common::RetryPolicy;
use std::path::PathBuf;

/// Configuration for the durable transaction log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for the fjall keyspace
    pub data_dir: PathBuf,

    /// Block cache size for fjall (in bytes)
    pub block_cache_size: u64,

    /// Durability requested after every write
    pub persist_mode: PersistMode,

    /// Retries applied to transient write failures
    pub write_retry: RetryPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        // Using .keep() so the directory outlives the TempDir guard
        let temp_dir = tempfile::tempdir()
            .map(|dir| dir.keep())
            .unwrap_or_else(|_| std::env::temp_dir().join("shardtx-log"));

        Self {
            data_dir: temp_dir,
            block_cache_size: 16 * 1024 * 1024, // 16 MB
            persist_mode: PersistMode::SyncAll,
            write_retry: RetryPolicy::default(),
        }
    }
}

impl LogConfig {
    /// Create a new config with the given data directory
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Config optimized for testing
    pub fn for_testing(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            block_cache_size: 1024 * 1024,
            persist_mode: PersistMode::Buffer, // Don't sync to disk in tests
            write_retry: RetryPolicy::for_testing(),
        }
    }

    pub fn with_persist_mode(mut self, mode: PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }
}
