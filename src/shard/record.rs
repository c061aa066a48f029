//! Shard registry records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Status of a registered shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Active,
    Inactive,
}

impl ShardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Parse the persisted form; anything unknown is treated as inactive
    pub fn from_db(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            _ => Self::Inactive,
        }
    }
}

/// One worker's entry in the shared registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Configured shard index
    pub shard_index: u32,

    /// Total shard count last propagated to this record
    pub total_shards: u32,

    /// Process identifier
    pub instance_id: String,

    pub last_heartbeat: DateTime<Utc>,

    pub status: ShardStatus,
}

impl ShardRecord {
    /// Create an active record with a fresh heartbeat
    pub fn new(instance_id: impl Into<String>, shard_index: u32, total_shards: u32) -> Self {
        Self::new_at(instance_id, shard_index, total_shards, Utc::now())
    }

    pub fn new_at(
        instance_id: impl Into<String>,
        shard_index: u32,
        total_shards: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            shard_index,
            total_shards,
            instance_id: instance_id.into(),
            last_heartbeat: now,
            status: ShardStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ShardStatus::Active
    }

    /// Heartbeat older than `timeout` at `now`
    pub fn is_heartbeat_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout
    }

    /// Refresh the heartbeat; a record marked inactive by a peer reactivates
    pub fn update_heartbeat_at(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.status = ShardStatus::Active;
    }
}
