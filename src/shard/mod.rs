//! Shard partitioning across horizontally-scaled workers
//!
//! Each worker registers a [`ShardRecord`] in a shared [`ShardRegistry`] and
//! refreshes it on a fixed heartbeat. Any worker that observes a stale peer
//! marks it inactive, and the total shard count is recomputed from the
//! surviving active set, so users of a dead shard are redistributed without
//! manual rebalancing.
//!
//! The registry is eventually consistent. During a re-partition, two workers
//! may briefly disagree about the total, which costs at most a duplicated or
//! delayed check for the affected users.

pub mod partitioner;
pub mod record;
pub mod registry;

pub use partitioner::{shard_of, HealReport, ShardPartitioner};
pub use record::{ShardRecord, ShardStatus};
pub use registry::{InMemoryShardRegistry, ShardRegistry};

/// Shard errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// Configured index outside `[0, total)`
    InvalidShardIndex { index: u32, total: u32 },

    /// Total shard count of zero
    InvalidTotalShards(u32),

    /// Only one of index/total was configured
    IncompleteConfig,

    /// Heartbeat for an instance with no record
    NotRegistered(String),

    /// Backing store failure
    Registry(String),
}

impl ShardError {
    /// Registry failures are retried on the next heartbeat; configuration
    /// errors are fatal at startup.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Registry(_) | Self::NotRegistered(_))
    }
}

impl std::fmt::Display for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidShardIndex { index, total } => {
                write!(f, "Shard index {} outside [0, {})", index, total)
            }
            Self::InvalidTotalShards(total) => write!(f, "Invalid total shard count: {}", total),
            Self::IncompleteConfig => {
                write!(f, "Shard index and total shards must be configured together")
            }
            Self::NotRegistered(id) => write!(f, "Instance not registered: {}", id),
            Self::Registry(msg) => write!(f, "Shard registry failure: {}", msg),
        }
    }
}

impl std::error::Error for ShardError {}
