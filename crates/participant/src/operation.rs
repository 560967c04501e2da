//! Document operations executed inside a transaction on one shard

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operations a transaction can run against a shard's documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardOperation {
    /// Read a document
    Get { key: String },

    /// Create a document; fails if the key exists
    Insert { key: String, value: Value },

    /// Create or replace a document
    Put { key: String, value: Value },

    /// Remove a document
    Delete { key: String },
}

impl ShardOperation {
    pub fn key(&self) -> &str {
        match self {
            ShardOperation::Get { key }
            | ShardOperation::Insert { key, .. }
            | ShardOperation::Put { key, .. }
            | ShardOperation::Delete { key } => key,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, ShardOperation::Get { .. })
    }
}

/// Result of a successful [`ShardOperation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResult {
    Get { key: String, value: Option<Value> },
    Inserted { key: String },
    Put { key: String, previous: Option<Value> },
    Deleted { key: String, deleted: bool },
}
