//! Shared shard registry
//!
//! The registry is the only coordination point between workers. The
//! in-memory implementation serves single-process deployments and tests;
//! [`crate::storage::Database`] provides the SQLite-backed one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::record::{ShardRecord, ShardStatus};
use super::ShardError;

/// Storage seam for shard records
#[async_trait]
pub trait ShardRegistry: Send + Sync {
    /// Insert or replace the record for `record.instance_id`
    async fn upsert(&self, record: ShardRecord) -> Result<(), ShardError>;

    /// Refresh an instance's heartbeat and mark it active
    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<(), ShardError>;

    /// All records, active or not
    async fn list(&self) -> Result<Vec<ShardRecord>, ShardError>;

    /// Mark an instance inactive
    async fn mark_inactive(&self, instance_id: &str) -> Result<(), ShardError>;

    /// Write the recomputed total to every active record
    async fn set_total_for_active(&self, total_shards: u32) -> Result<(), ShardError>;
}

// ============================================================================
// In-memory Registry
// ============================================================================

/// Registry held in process memory
#[derive(Default, Clone)]
pub struct InMemoryShardRegistry {
    records: Arc<RwLock<HashMap<String, ShardRecord>>>,
}

impl InMemoryShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get one record
    pub async fn get(&self, instance_id: &str) -> Option<ShardRecord> {
        self.records.read().await.get(instance_id).cloned()
    }
}

#[async_trait]
impl ShardRegistry for InMemoryShardRegistry {
    async fn upsert(&self, record: ShardRecord) -> Result<(), ShardError> {
        self.records
            .write()
            .await
            .insert(record.instance_id.clone(), record);
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<(), ShardError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(instance_id)
            .ok_or_else(|| ShardError::NotRegistered(instance_id.to_string()))?;
        record.update_heartbeat_at(at);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ShardRecord>, ShardError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn mark_inactive(&self, instance_id: &str) -> Result<(), ShardError> {
        if let Some(record) = self.records.write().await.get_mut(instance_id) {
            record.status = ShardStatus::Inactive;
        }
        Ok(())
    }

    async fn set_total_for_active(&self, total_shards: u32) -> Result<(), ShardError> {
        for record in self.records.write().await.values_mut() {
            if record.is_active() {
                record.total_shards = total_shards;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let registry = InMemoryShardRegistry::new();
        let result = registry.heartbeat("ghost", Utc::now()).await;
        assert_eq!(result, Err(ShardError::NotRegistered("ghost".to_string())));
    }

    #[tokio::test]
    async fn test_total_only_propagates_to_active() {
        let registry = InMemoryShardRegistry::new();
        registry.upsert(ShardRecord::new("a", 0, 3)).await.unwrap();
        registry.upsert(ShardRecord::new("b", 1, 3)).await.unwrap();
        registry.upsert(ShardRecord::new("c", 2, 3)).await.unwrap();

        registry.mark_inactive("b").await.unwrap();
        registry.set_total_for_active(2).await.unwrap();

        assert_eq!(registry.get("a").await.unwrap().total_shards, 2);
        assert_eq!(registry.get("b").await.unwrap().total_shards, 3);
        assert_eq!(registry.get("b").await.unwrap().status, ShardStatus::Inactive);
    }
}
