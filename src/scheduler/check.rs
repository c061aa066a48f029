//! Check execution
//!
//! One check is: solve a captcha with the owner's solver, then query the
//! status endpoint through a pooled client. The account row is written once,
//! after the network result is known, while holding that account's lock.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::account::{AccountStore, BanStatus, MonitoredAccount, StatusTransition, UserSettings};
use super::error::{CheckError, CheckResult, DisableReason};
use super::policy::DuePolicy;
use crate::captcha::SolverRegistry;
use crate::config::{CheckerConfig, MAX_INTERVAL_SECS};
use crate::metrics;
use crate::notifications::{AdminNotifier, Notification, NotificationError, NotificationQueue, NotificationType};
use crate::proxy::ProxyPool;
use crate::shard::ShardPartitioner;
use crate::utils::retry::{with_retry_if, RetryConfig};
use crate::utils::truncate_text;

type StatusLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// Result of checking one account
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub account_id: String,

    /// Observed status, when the check succeeded
    pub status: Option<BanStatus>,

    /// Status differs from the stored one
    pub changed: bool,

    /// Set when this check disabled the account
    pub disabled: Option<DisableReason>,

    pub error: Option<CheckError>,
}

impl CheckOutcome {
    /// Throttled by the status endpoint; nothing was recorded
    pub fn is_deferred(&self) -> bool {
        matches!(self.error, Some(CheckError::RateLimited { .. }))
    }
}

/// Totals for one scheduling pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,

    /// Owned by another shard
    pub foreign: usize,

    pub due: usize,
    pub succeeded: usize,

    /// Rate limited; still due next tick
    pub deferred: usize,

    pub changed: usize,
    pub failed: usize,
    pub disabled: usize,
}

/// Decides which accounts are due and checks them
pub struct CheckScheduler {
    config: CheckerConfig,
    policy: DuePolicy,
    retry: RetryConfig,
    partitioner: Arc<ShardPartitioner>,
    proxies: Arc<ProxyPool>,
    solvers: Arc<SolverRegistry>,
    store: Arc<dyn AccountStore>,
    queue: Arc<NotificationQueue>,
    admin: Arc<AdminNotifier>,
    rate_limiter: StatusLimiter,
    account_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CheckScheduler {
    pub fn new(
        config: CheckerConfig,
        partitioner: Arc<ShardPartitioner>,
        proxies: Arc<ProxyPool>,
        solvers: Arc<SolverRegistry>,
        store: Arc<dyn AccountStore>,
        queue: Arc<NotificationQueue>,
    ) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            policy: DuePolicy::from_config(&config),
            retry: RetryConfig::with_delays(config.network_retries, 500, 5_000).with_jitter(),
            partitioner,
            proxies,
            solvers,
            store,
            queue,
            admin: Arc::new(AdminNotifier::disabled()),
            rate_limiter: RateLimiter::direct(Quota::per_second(rate)),
            account_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_admin(mut self, admin: Arc<AdminNotifier>) -> Self {
        self.admin = admin;
        self
    }

    /// Override the local retry schedule for transient failures
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn should_check(&self, account: &MonitoredAccount, settings: &UserSettings, now: DateTime<Utc>) -> bool {
        self.policy.should_check(account, settings, now)
    }

    /// Solve, then query the status endpoint. Transient failures are retried
    /// locally; nothing is written.
    pub async fn run_check(&self, account: &MonitoredAccount, settings: &UserSettings) -> CheckResult<BanStatus> {
        with_retry_if(
            &self.retry,
            || self.attempt(account, settings),
            CheckError::is_transient,
        )
        .await
    }

    /// One solve plus one status request. Tokens are single-use, so every
    /// attempt solves afresh.
    async fn attempt(&self, account: &MonitoredAccount, settings: &UserSettings) -> CheckResult<BanStatus> {
        let solved = self
            .solvers
            .solve(&settings.solver, &self.config.site_key, &self.config.page_url)
            .await?;

        debug!(
            account_id = %account.id,
            provider = %solved.provider,
            self_funded = solved.self_funded,
            "Captcha solved"
        );

        self.query_status(account, &solved.token).await
    }

    /// Check one account now
    pub async fn check_account(&self, account_id: &str) -> CheckResult<CheckOutcome> {
        self.check_account_at(account_id, Utc::now()).await
    }

    pub async fn check_account_at(&self, account_id: &str, now: DateTime<Utc>) -> CheckResult<CheckOutcome> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| CheckError::Store(format!("unknown account {account_id}")))?;
        let settings = self.store.user_settings(&account.user_key).await?;

        let result = {
            let _timer = metrics::Timer::check();
            self.run_check(&account, &settings).await
        };

        match result {
            Ok(status) => {
                let previous = account.status;
                let changed = status != previous;

                account.last_check = Some(now);
                account.consecutive_errors = 0;
                account.last_success = Some(now);
                account.last_error_message = None;
                if status == BanStatus::InvalidCredential {
                    account.cookie_expired = true;
                }
                if changed {
                    account.status = status;
                    account.status_changed_at = Some(now);
                    // History first: if it fails the row is untouched and the
                    // next check sees the change again
                    self.record_transition(&account, previous, now).await?;
                }
                self.store.update_account(&account).await?;

                if changed {
                    self.notify_status_change(&account, &settings, previous).await;
                }
                metrics::record_check(if changed { "changed" } else { "unchanged" });

                Ok(CheckOutcome {
                    account_id: account.id,
                    status: Some(status),
                    changed,
                    disabled: None,
                    error: None,
                })
            }
            Err(CheckError::RateLimited { retry_after_secs }) => {
                // Not the account's fault: leave the row as is so it stays due
                info!(
                    account_id = %account.id,
                    user_key = %account.user_key,
                    retry_after_secs = retry_after_secs,
                    "Status endpoint rate limited the check, deferring"
                );
                metrics::record_check("rate_limited");

                Ok(CheckOutcome {
                    account_id: account.id,
                    status: None,
                    changed: false,
                    disabled: None,
                    error: Some(CheckError::RateLimited { retry_after_secs }),
                })
            }
            Err(err) => {
                account.last_check = Some(now);
                account.consecutive_errors += 1;
                account.last_error = Some(now);
                account.last_error_message = Some(truncate_text(&err.to_string(), 200));

                let reason = err.disable_reason().or_else(|| {
                    (account.consecutive_errors >= self.config.max_consecutive_errors)
                        .then_some(DisableReason::RepeatedFailures)
                });
                let newly_disabled = reason.filter(|_| !account.check_disabled);
                if let Some(reason) = newly_disabled {
                    account.check_disabled = true;
                    account.disabled_reason = Some(reason.describe().to_string());
                }
                self.store.update_account(&account).await?;

                warn!(
                    account_id = %account.id,
                    user_key = %account.user_key,
                    consecutive_errors = account.consecutive_errors,
                    error = %err,
                    "Account check failed"
                );
                metrics::record_check(err.label());

                if let Some(reason) = newly_disabled {
                    self.on_disabled(&account, &settings, reason).await;
                }
                self.admin
                    .notify(
                        &format!("check:{}", err.label()),
                        &format!("Check of account {} failed: {}", account.id, err),
                    )
                    .await;

                Ok(CheckOutcome {
                    account_id: account.id,
                    status: None,
                    changed: false,
                    disabled: newly_disabled,
                    error: Some(err),
                })
            }
        }
    }

    /// Check every due account owned by this shard
    pub async fn run_cycle(&self) -> CheckResult<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CheckResult<CycleReport> {
        let accounts = self.store.list_accounts().await?;
        let mut report = CycleReport {
            scanned: accounts.len(),
            ..CycleReport::default()
        };

        let mut settings_cache: HashMap<String, UserSettings> = HashMap::new();
        let mut due = Vec::new();

        for account in accounts {
            if !self.partitioner.belongs_to_this_instance(&account.user_key) {
                report.foreign += 1;
                continue;
            }
            if !settings_cache.contains_key(&account.user_key) {
                let settings = self.store.user_settings(&account.user_key).await?;
                settings_cache.insert(account.user_key.clone(), settings);
            }
            let Some(settings) = settings_cache.get(&account.user_key) else {
                continue;
            };
            if self.should_check(&account, settings, now) {
                due.push(account.id);
            }
        }
        report.due = due.len();

        let results: Vec<CheckResult<CheckOutcome>> = stream::iter(due)
            .map(|account_id| async move { self.check_account_at(&account_id, now).await })
            .buffer_unordered(self.config.max_concurrent_checks.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(outcome) => {
                    if outcome.is_deferred() {
                        report.deferred += 1;
                    } else if outcome.error.is_some() {
                        report.failed += 1;
                    } else {
                        report.succeeded += 1;
                    }
                    if outcome.changed {
                        report.changed += 1;
                    }
                    if outcome.disabled.is_some() {
                        report.disabled += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Check could not be completed");
                }
            }
        }

        Ok(report)
    }

    /// Run a cycle every `tick_interval_secs` until shutdown
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_cycle().await {
                            Ok(report) if report.due > 0 => info!(
                                scanned = report.scanned,
                                due = report.due,
                                succeeded = report.succeeded,
                                deferred = report.deferred,
                                changed = report.changed,
                                failed = report.failed,
                                disabled = report.disabled,
                                "Check cycle finished"
                            ),
                            Ok(report) => debug!(scanned = report.scanned, foreign = report.foreign, "No accounts due"),
                            Err(e) => warn!(error = %e, "Check cycle failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Check scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn query_status(&self, account: &MonitoredAccount, token: &str) -> CheckResult<BanStatus> {
        self.rate_limiter.until_ready().await;

        let pooled = self.proxies.get_client().await;
        let route = pooled.route_id.as_deref();

        let mut request = pooled
            .client
            .post(&self.config.status_url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .json(&serde_json::json!({
                "accountId": account.external_id,
                "captchaToken": token,
            }));
        if let Some(session) = &account.session {
            request = request.header(reqwest::header::COOKIE, session);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = e.without_url().to_string();
                if let Some(route) = route {
                    self.proxies.mark_failure(route, &reason).await;
                }
                return Err(CheckError::Network(reason));
            }
        };

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => {
                self.mark_success(route).await;
                Ok(BanStatus::InvalidCredential)
            }
            StatusCode::FORBIDDEN => {
                self.mark_success(route).await;
                Err(CheckError::AccessRevoked)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                if let Some(route) = route {
                    let backoff = retry_after_secs
                        .unwrap_or(self.config.rate_limit_backoff_secs)
                        .min(MAX_INTERVAL_SECS);
                    self.proxies
                        .mark_rate_limited(route, Duration::from_secs(backoff))
                        .await;
                }
                Err(CheckError::RateLimited { retry_after_secs })
            }
            s if s.is_server_error() => {
                let reason = format!("HTTP {}", s.as_u16());
                if let Some(route) = route {
                    self.proxies.mark_failure(route, &reason).await;
                }
                Err(CheckError::Network(reason))
            }
            s if s.is_success() => {
                self.mark_success(route).await;
                let body = response
                    .text()
                    .await
                    .map_err(|e| CheckError::Network(e.without_url().to_string()))?;
                let parsed: StatusResponse =
                    serde_json::from_str(&body).map_err(|_| CheckError::UnexpectedResponse {
                        status: s.as_u16(),
                        body: truncate_text(&body, 200),
                    })?;
                Ok(BanStatus::from_response(&parsed.status))
            }
            s => {
                self.mark_success(route).await;
                let body = response.text().await.unwrap_or_default();
                Err(CheckError::UnexpectedResponse {
                    status: s.as_u16(),
                    body: truncate_text(&body, 200),
                })
            }
        }
    }

    async fn mark_success(&self, route: Option<&str>) {
        if let Some(route) = route {
            self.proxies.mark_success(route).await;
        }
    }

    async fn record_transition(
        &self,
        account: &MonitoredAccount,
        previous: BanStatus,
        now: DateTime<Utc>,
    ) -> CheckResult<()> {
        let transition = StatusTransition {
            account_id: account.id.clone(),
            user_key: account.user_key.clone(),
            from: previous,
            to: account.status,
            at: now,
        };
        self.store.record_transition(&transition).await
    }

    async fn notify_status_change(&self, account: &MonitoredAccount, settings: &UserSettings, previous: BanStatus) {
        info!(
            account_id = %account.id,
            user_key = %account.user_key,
            from = %previous,
            to = %account.status,
            "Account status changed"
        );

        let message = format!(
            "Account {} is now {} (was {})",
            account.external_id,
            account.status.describe(),
            previous.describe()
        );
        self.submit(
            Notification::new(&account.user_key, NotificationType::StatusChange, message).for_account(&account.id),
            settings,
        )
        .await;
    }

    async fn on_disabled(&self, account: &MonitoredAccount, settings: &UserSettings, reason: DisableReason) {
        warn!(
            account_id = %account.id,
            user_key = %account.user_key,
            reason = %reason,
            "Account checks disabled"
        );
        let message = format!(
            "Checks for account {} were disabled: {}",
            account.external_id,
            reason.describe()
        );
        self.submit(
            Notification::new(&account.user_key, NotificationType::AccountDisabled, message).for_account(&account.id),
            settings,
        )
        .await;
    }

    async fn submit(&self, notification: Notification, settings: &UserSettings) {
        match self.queue.submit(notification, settings.solver.is_self_funded()).await {
            Ok(()) => {}
            Err(NotificationError::Denied { user_key, kind, reason }) => {
                debug!(user_key = %user_key, kind = %kind, reason = %reason, "Notification suppressed");
            }
            Err(e) => warn!(error = %e, "Failed to submit notification"),
        }
    }

    fn account_lock(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.account_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(account_id.to_string()).or_default())
    }
}
