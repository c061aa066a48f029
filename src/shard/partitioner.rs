//! Deterministic user-to-shard assignment with heartbeat healing
//!
//! A user belongs to the shard whose *rank* (position among the active shard
//! indices, sorted) equals `stable_hash(user) % active_count`. Using the rank
//! instead of the raw configured index keeps the partition exhaustive when a
//! shard in the middle of the index range dies.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::record::{ShardRecord, ShardStatus};
use super::registry::ShardRegistry;
use super::ShardError;
use crate::metrics;
use crate::utils::stable_hash;

/// Slot a user key maps to for a given total shard count
pub fn shard_of(user_key: &str, total_shards: u32) -> u32 {
    (stable_hash(user_key) % u64::from(total_shards.max(1))) as u32
}

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealReport {
    /// Peers marked inactive during this tick
    pub marked_inactive: Vec<String>,

    /// Total before the tick
    pub previous_total: u32,

    /// Total after the tick (count of active shards)
    pub total_shards: u32,

    /// This instance's rank among the active shards
    pub rank: u32,
}

impl HealReport {
    pub fn total_changed(&self) -> bool {
        self.previous_total != self.total_shards
    }
}

/// Current partition as seen by this instance
#[derive(Debug, Clone, Copy)]
struct PartitionView {
    shard_index: u32,
    total_shards: u32,
    rank: u32,
    sharded: bool,
}

impl Default for PartitionView {
    fn default() -> Self {
        Self {
            shard_index: 0,
            total_shards: 1,
            rank: 0,
            sharded: false,
        }
    }
}

/// Decides which users this worker is responsible for
pub struct ShardPartitioner {
    instance_id: String,
    registry: Arc<dyn ShardRegistry>,
    heartbeat_interval: Duration,
    heartbeat_timeout: chrono::Duration,
    view: RwLock<PartitionView>,
}

impl ShardPartitioner {
    pub fn new(
        instance_id: impl Into<String>,
        registry: Arc<dyn ShardRegistry>,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            registry,
            heartbeat_interval,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
            view: RwLock::new(PartitionView::default()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register this instance.
    ///
    /// With neither value configured the instance runs as shard 0 of 1 and
    /// never touches the registry.
    pub async fn initialize(
        &self,
        shard_index: Option<u32>,
        total_shards: Option<u32>,
    ) -> Result<(), ShardError> {
        self.initialize_at(shard_index, total_shards, Utc::now()).await
    }

    pub async fn initialize_at(
        &self,
        shard_index: Option<u32>,
        total_shards: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<(), ShardError> {
        let (index, total) = match (shard_index, total_shards) {
            (None, None) => {
                self.set_view(PartitionView::default());
                info!(instance_id = %self.instance_id, "Running in single-shard mode");
                return Ok(());
            }
            (Some(index), Some(total)) => (index, total),
            _ => return Err(ShardError::IncompleteConfig),
        };

        if total == 0 {
            return Err(ShardError::InvalidTotalShards(total));
        }
        if index >= total {
            return Err(ShardError::InvalidShardIndex { index, total });
        }

        self.registry
            .upsert(ShardRecord::new_at(&self.instance_id, index, total, now))
            .await?;

        self.set_view(PartitionView {
            shard_index: index,
            total_shards: total,
            rank: index,
            sharded: true,
        });
        metrics::set_active_shards(total);

        info!(
            instance_id = %self.instance_id,
            shard_index = index,
            total_shards = total,
            "Shard registered"
        );
        Ok(())
    }

    /// Whether this instance is responsible for `user_key` right now
    pub fn belongs_to_this_instance(&self, user_key: &str) -> bool {
        let view = self.current_view();
        if !view.sharded || view.total_shards <= 1 {
            return true;
        }
        shard_of(user_key, view.total_shards) == view.rank
    }

    /// Current total shard count used as the modulus
    pub fn total_shards(&self) -> u32 {
        self.current_view().total_shards
    }

    /// Rank among the active shards
    pub fn rank(&self) -> u32 {
        self.current_view().rank
    }

    /// Configured shard index
    pub fn shard_index(&self) -> u32 {
        self.current_view().shard_index
    }

    /// One heartbeat period: refresh own record, expire stale peers, recompute
    /// and propagate the total.
    pub async fn heartbeat_tick(&self) -> Result<HealReport, ShardError> {
        self.heartbeat_tick_at(Utc::now()).await
    }

    pub async fn heartbeat_tick_at(&self, now: DateTime<Utc>) -> Result<HealReport, ShardError> {
        let view = self.current_view();
        if !view.sharded {
            return Ok(HealReport {
                marked_inactive: Vec::new(),
                previous_total: 1,
                total_shards: 1,
                rank: 0,
            });
        }

        match self.registry.heartbeat(&self.instance_id, now).await {
            Ok(()) => {}
            Err(ShardError::NotRegistered(_)) => {
                warn!(instance_id = %self.instance_id, "Shard record missing, re-registering");
                self.registry
                    .upsert(ShardRecord::new_at(
                        &self.instance_id,
                        view.shard_index,
                        view.total_shards,
                        now,
                    ))
                    .await?;
            }
            Err(e) => return Err(e),
        }

        let mut records = self.registry.list().await?;
        let mut marked_inactive = Vec::new();

        for record in records.iter_mut() {
            if record.instance_id == self.instance_id || !record.is_active() {
                continue;
            }
            if record.is_heartbeat_stale_at(now, self.heartbeat_timeout) {
                self.registry.mark_inactive(&record.instance_id).await?;
                record.status = ShardStatus::Inactive;
                warn!(
                    peer = %record.instance_id,
                    shard_index = record.shard_index,
                    last_heartbeat = %record.last_heartbeat,
                    "Marked stale shard inactive"
                );
                marked_inactive.push(record.instance_id.clone());
            }
        }

        let mut active: Vec<&ShardRecord> = records.iter().filter(|r| r.is_active()).collect();
        active.sort_by(|a, b| {
            a.shard_index
                .cmp(&b.shard_index)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        let total = (active.len() as u32).max(1);
        let rank = active
            .iter()
            .position(|r| r.instance_id == self.instance_id)
            .map(|p| p as u32)
            .unwrap_or(0);

        self.registry.set_total_for_active(total).await?;

        self.set_view(PartitionView {
            rank,
            total_shards: total,
            ..view
        });
        metrics::set_active_shards(total);

        let report = HealReport {
            marked_inactive,
            previous_total: view.total_shards,
            total_shards: total,
            rank,
        };

        if report.total_changed() {
            info!(
                instance_id = %self.instance_id,
                previous_total = report.previous_total,
                total_shards = total,
                rank = rank,
                "Shard partition recomputed"
            );
        } else {
            debug!(total_shards = total, rank = rank, "Heartbeat recorded");
        }

        Ok(report)
    }

    /// Run the heartbeat loop until shutdown
    pub fn start_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.heartbeat_tick().await {
                            warn!(error = %e, "Heartbeat tick failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!(instance_id = %self.instance_id, "Heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn current_view(&self) -> PartitionView {
        match self.view.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_view(&self, view: PartitionView) {
        match self.view.write() {
            Ok(mut guard) => *guard = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
    }
}
