//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use banwatch::captcha::{CaptchaError, CaptchaSolver, KeyValidation, ProviderKind, SolverRegistry};
use banwatch::config::{CheckerConfig, NotificationConfig, ProxyConfig};
use banwatch::notifications::channels::ChannelResult;
use banwatch::notifications::{
    DeliveryStatus, Notification, NotificationChannel, NotificationLimiter, NotificationQueue,
};
use banwatch::proxy::{ProxyPool, StaticSource};
use banwatch::scheduler::{AccountStore, CheckScheduler, InMemoryAccountStore};
use banwatch::shard::{InMemoryShardRegistry, ShardPartitioner};
use banwatch::utils::retry::RetryConfig;

// ============================================================================
// Solver
// ============================================================================

/// Solver that answers instantly with a fixed token
pub struct FakeSolver {
    pub kind: ProviderKind,
    pub token: String,
    pub balance: f64,
    pub failure: Option<CaptchaError>,
    pub solves: AtomicU32,
}

impl FakeSolver {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            token: "captcha-token".to_string(),
            balance: 10.0,
            failure: None,
            solves: AtomicU32::new(0),
        }
    }

    pub fn failing(kind: ProviderKind, error: CaptchaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new(kind)
        }
    }

    pub fn solve_count(&self) -> u32 {
        self.solves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptchaSolver for FakeSolver {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn solve(&self, _site_key: &str, _page_url: &str) -> Result<String, CaptchaError> {
        self.solves.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.token.clone()),
        }
    }

    async fn validate_key(&self) -> Result<KeyValidation, CaptchaError> {
        Ok(KeyValidation {
            valid: true,
            balance: self.balance,
        })
    }
}

/// Registry with one operator solver and no user-key factory
pub fn registry_with(solver: Arc<dyn CaptchaSolver>) -> SolverRegistry {
    let mut registry = SolverRegistry::new(
        solver.provider(),
        Duration::from_secs(600),
        Box::new(|kind, _key| Err(CaptchaError::NoSolver(kind.as_str().to_string()))),
    );
    registry.register_operator(solver, 1.0);
    registry
}

// ============================================================================
// Channel
// ============================================================================

/// Channel that keeps everything it is asked to deliver
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> ChannelResult<DeliveryStatus> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(DeliveryStatus::delivered("recording"))
    }
}

// ============================================================================
// Scheduler Harness
// ============================================================================

pub fn checker_config(status_url: &str) -> CheckerConfig {
    CheckerConfig {
        status_url: status_url.to_string(),
        site_key: "site-key".to_string(),
        page_url: "https://appeals.example.com/".to_string(),
        max_consecutive_errors: 3,
        requests_per_second: 100,
        request_timeout_secs: 5,
        ..CheckerConfig::default()
    }
}

/// A single-shard scheduler wired to in-memory collaborators
pub struct Harness {
    pub scheduler: Arc<CheckScheduler>,
    pub store: Arc<InMemoryAccountStore>,
    pub proxies: Arc<ProxyPool>,
    pub queue: Arc<NotificationQueue>,
    pub channel: Arc<RecordingChannel>,
}

impl Harness {
    pub async fn new(status_url: &str, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self::with_proxies(status_url, solver, "", 3).await
    }

    pub async fn with_proxies(
        status_url: &str,
        solver: Arc<dyn CaptchaSolver>,
        proxy_list: &str,
        failure_threshold: u32,
    ) -> Self {
        Self::build(status_url, solver, proxy_list, failure_threshold, |store| store).await
    }

    /// Scheduler sees `wrap(store)`; `Harness::store` stays the inner store
    pub async fn with_store_wrapper(
        status_url: &str,
        solver: Arc<dyn CaptchaSolver>,
        wrap: impl FnOnce(Arc<dyn AccountStore>) -> Arc<dyn AccountStore>,
    ) -> Self {
        Self::build(status_url, solver, "", 3, wrap).await
    }

    async fn build(
        status_url: &str,
        solver: Arc<dyn CaptchaSolver>,
        proxy_list: &str,
        failure_threshold: u32,
        wrap: impl FnOnce(Arc<dyn AccountStore>) -> Arc<dyn AccountStore>,
    ) -> Self {
        let partitioner = Arc::new(ShardPartitioner::new(
            "test-worker",
            Arc::new(InMemoryShardRegistry::new()),
            Duration::from_secs(30),
            Duration::from_secs(120),
        ));
        partitioner.initialize(None, None).await.unwrap();

        let proxy_config = ProxyConfig {
            failure_threshold,
            request_timeout_secs: 5,
            ..ProxyConfig::default()
        };
        let proxies = Arc::new(
            ProxyPool::new(&proxy_config, Box::new(StaticSource(proxy_list.to_string()))).unwrap(),
        );

        let limiter = Arc::new(NotificationLimiter::from_config(&NotificationConfig::default()));
        let channel = Arc::new(RecordingChannel::default());
        let queue = Arc::new(NotificationQueue::new(limiter, channel.clone()));

        let store = Arc::new(InMemoryAccountStore::new());
        let inner: Arc<dyn AccountStore> = store.clone();
        let account_store = wrap(inner);

        let scheduler = Arc::new(
            CheckScheduler::new(
                checker_config(status_url),
                partitioner,
                Arc::clone(&proxies),
                Arc::new(registry_with(solver)),
                account_store,
                Arc::clone(&queue),
            )
            .with_retry(RetryConfig::with_delays(2, 10, 50)),
        );

        Self {
            scheduler,
            store,
            proxies,
            queue,
            channel,
        }
    }
}

/// A TCP port nothing is listening on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
