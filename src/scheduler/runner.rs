//! Worker runtime: wires the components and owns the background loops

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::account::{AccountStore, InMemoryAccountStore};
use super::check::CheckScheduler;
use crate::captcha::SolverRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::notifications::{
    AdminNotifier, LogChannel, NotificationChannel, NotificationLimiter, NotificationQueue, WebhookChannel,
};
use crate::proxy::{source_for, ProxyPool};
use crate::shard::{ShardPartitioner, ShardRegistry};
use crate::storage::Database;

/// Fully wired worker, not yet running
pub struct Worker {
    config: Config,
    pub partitioner: Arc<ShardPartitioner>,
    pub proxies: Arc<ProxyPool>,
    pub limiter: Arc<NotificationLimiter>,
    pub queue: Arc<NotificationQueue>,
    pub scheduler: Arc<CheckScheduler>,
    pub store: Arc<InMemoryAccountStore>,
}

impl Worker {
    /// Open storage, register the shard and build every component
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let database = Arc::new(Database::open(&config.database.sqlite_path)?);

        let registry: Arc<dyn ShardRegistry> = database.clone();
        let partitioner = Arc::new(ShardPartitioner::new(
            config.shard.instance_id.clone(),
            registry,
            config.heartbeat_interval(),
            Duration::from_secs(config.shard.heartbeat_timeout_secs),
        ));
        partitioner
            .initialize(config.shard.shard_index, config.shard.total_shards)
            .await?;

        let proxies = Arc::new(
            ProxyPool::new(&config.proxy, source_for(&config.proxy))?.with_stats_store(database.clone()),
        );

        let solvers = Arc::new(SolverRegistry::from_config(&config.captcha)?);

        let limiter = Arc::new(
            NotificationLimiter::from_config(&config.notifications).with_denial_log(database.clone()),
        );
        let channel = channel_for(config.notifications.user_webhook_url.as_deref(), "user_webhook")?
            .unwrap_or_else(|| Arc::new(LogChannel) as Arc<dyn NotificationChannel>);
        let queue = Arc::new(NotificationQueue::from_config(
            &config.notifications,
            Arc::clone(&limiter),
            channel,
        ));

        let admin = Arc::new(
            AdminNotifier::new(channel_for(
                config.notifications.admin_webhook_url.as_deref(),
                "admin_webhook",
            )?)
            .with_dedup_window(config.notifications.admin_dedup_window_minutes),
        );

        let store = Arc::new(match &config.database.accounts_path {
            Some(path) => InMemoryAccountStore::load(path).await?,
            None => InMemoryAccountStore::new(),
        });
        let account_store: Arc<dyn AccountStore> = store.clone();

        let scheduler = Arc::new(
            CheckScheduler::new(
                config.checker.clone(),
                Arc::clone(&partitioner),
                Arc::clone(&proxies),
                solvers,
                account_store,
                Arc::clone(&queue),
            )
            .with_admin(admin),
        );

        Ok(Self {
            config,
            partitioner,
            proxies,
            limiter,
            queue,
            scheduler,
            store,
        })
    }

    /// Spawn the heartbeat, proxy refresh, queue drain, cleanup and check loops
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            Arc::clone(&self.partitioner).start_heartbeat(shutdown_rx.clone()),
            Arc::clone(&self.proxies).start_refresh_loop(shutdown_rx.clone()),
            Arc::clone(&self.queue).start(shutdown_rx.clone()),
            Arc::clone(&self.limiter).start_cleanup_loop(
                Duration::from_secs(self.config.notifications.cleanup_interval_secs.max(1)),
                shutdown_rx.clone(),
            ),
            Arc::clone(&self.scheduler).start(shutdown_rx),
        ];

        info!(
            instance_id = %self.partitioner.instance_id(),
            rank = self.partitioner.rank(),
            total_shards = self.partitioner.total_shards(),
            "Worker started"
        );

        WorkerHandle {
            shutdown: shutdown_tx,
            tasks,
            store: self.store,
        }
    }
}

fn channel_for(url: Option<&str>, name: &str) -> Result<Option<Arc<dyn NotificationChannel>>> {
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let channel = WebhookChannel::from_url(url)?.named(name);
    Ok(Some(Arc::new(channel)))
}

/// Running worker
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    store: Arc<InMemoryAccountStore>,
}

impl WorkerHandle {
    /// Signal every loop, wait for them and persist the account store
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down worker");
        self.shutdown.send_replace(true);

        for task in futures::future::join_all(self.tasks).await {
            if let Err(e) = task {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.store.save().await?;
        info!("Worker stopped");
        Ok(())
    }
}
