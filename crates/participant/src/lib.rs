//! Transaction participants
//!
//! [`ParticipantTransport`] is the coordinator's view of a shard. This crate
//! also provides [`LocalShard`], an in-memory document shard that keeps a
//! replication history of prepare and decision markers, and
//! [`InProcessTransport`] which routes requests to local shards.

pub mod error;
mod lock;
pub mod operation;
pub mod oplog;
pub mod shard;
pub mod transport;

pub use error::{Result, ShardError, TransportError};
pub use operation::{OperationResult, ShardOperation};
pub use oplog::{DurableShardState, HighWaterMark, OplogEntry, RecordId, RecordIdHistory, StagedWrite};
pub use shard::{
    LocalShard, MessageCounts, PreparedTransaction, RestoredShard, ShardFaults, StoredDocument,
};
pub use transport::{InProcessTransport, ParticipantTransport};
