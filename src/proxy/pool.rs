//! Route selection, circuit breaking and refresh

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::route::{parse_proxy_list, ProxyRoute, RouteHealth};
use super::source::ProxyListSource;
use super::stats::{ProxyStatsStore, RouteStats};
use super::ProxyError;
use crate::config::ProxyConfig;
use crate::metrics;
use crate::utils::truncate_text;

// ============================================================================
// Selection Strategy
// ============================================================================

/// How a route is picked among the eligible ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cyclic scan skipping ineligible routes
    #[default]
    RoundRobin,

    /// Uniform over eligible routes
    Random,

    /// Eligible route with the oldest last-used time
    LeastUsed,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastUsed => "least_used",
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_used" | "leastused" => Ok(Self::LeastUsed),
            other => Err(format!("unknown proxy strategy: {other}")),
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Client handed to a caller, with the route it goes through
#[derive(Debug, Clone)]
pub struct PooledClient {
    pub client: Client,

    /// Masked route id; `None` for the direct fallback
    pub route_id: Option<String>,
}

impl PooledClient {
    pub fn is_direct(&self) -> bool {
        self.route_id.is_none()
    }
}

/// Result of a refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub reactivated: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

struct RouteEntry {
    route: ProxyRoute,
    client: Client,
}

/// Pool of egress routes
pub struct ProxyPool {
    entries: RwLock<Vec<RouteEntry>>,
    cursor: AtomicUsize,
    strategy: SelectionStrategy,
    failure_threshold: u32,
    cooldown: chrono::Duration,
    request_timeout: Duration,
    refresh_interval: Duration,
    direct: Client,
    source: Box<dyn ProxyListSource>,
    stats: Option<Arc<dyn ProxyStatsStore>>,
}

impl ProxyPool {
    /// Build the pool from the source's current list.
    ///
    /// A malformed entry is a startup error; an empty list is not.
    pub fn new(config: &ProxyConfig, source: Box<dyn ProxyListSource>) -> Result<Self, ProxyError> {
        let request_timeout = config.request_timeout();
        let direct = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|_| ProxyError::ClientBuild {
                route: "direct".to_string(),
                reason: "TLS backend unavailable".to_string(),
            })?;

        let mut entries = Vec::new();
        for route in parse_proxy_list(&source.load()?)? {
            entries.push(build_entry(route, request_timeout)?);
        }

        info!(
            routes = entries.len(),
            strategy = config.strategy.as_str(),
            "Proxy pool initialized"
        );

        Ok(Self {
            entries: RwLock::new(entries),
            cursor: AtomicUsize::new(0),
            strategy: config.strategy,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: chrono::Duration::from_std(config.cooldown())
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            request_timeout,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
            direct,
            source,
            stats: None,
        })
    }

    /// Persist every outcome through `store`
    pub fn with_stats_store(mut self, store: Arc<dyn ProxyStatsStore>) -> Self {
        self.stats = Some(store);
        self
    }

    /// Pick a route for one outbound request
    pub async fn get_client(&self) -> PooledClient {
        self.get_client_at(Utc::now()).await
    }

    pub async fn get_client_at(&self, now: DateTime<Utc>) -> PooledClient {
        let mut entries = self.entries.write().await;

        let selected = match self.strategy {
            SelectionStrategy::RoundRobin => self.select_round_robin(&entries, now),
            SelectionStrategy::Random => {
                let eligible: Vec<usize> = eligible_indices(&entries, now).collect();
                eligible.choose(&mut rand::thread_rng()).copied()
            }
            SelectionStrategy::LeastUsed => {
                eligible_indices(&entries, now).min_by_key(|&i| entries[i].route.last_used)
            }
        };

        match selected {
            Some(index) => {
                let entry = &mut entries[index];
                entry.route.last_used = Some(now);
                debug!(route = %entry.route.id(), "Selected proxy route");
                PooledClient {
                    client: entry.client.clone(),
                    route_id: Some(entry.route.id().to_string()),
                }
            }
            None => {
                if entries.is_empty() {
                    debug!("No proxy routes configured, using direct connection");
                } else {
                    warn!(
                        routes = entries.len(),
                        "No eligible proxy route, falling back to direct connection"
                    );
                }
                metrics::record_proxy_outcome("direct");
                PooledClient {
                    client: self.direct.clone(),
                    route_id: None,
                }
            }
        }
    }

    /// Any success resets the consecutive-failure counter
    pub async fn mark_success(&self, route_id: &str) {
        let now = Utc::now();
        let stats = {
            let mut entries = self.entries.write().await;
            let Some(route) = find_route(&mut entries, route_id) else {
                debug!(route = route_id, "Success reported for unknown route");
                return;
            };
            route.consecutive_failures = 0;
            route.success_count += 1;
            RouteStats::from_route(route, now)
        };
        metrics::record_proxy_outcome("success");
        self.persist(stats);
    }

    /// Count a failure; reaching the threshold suspends the route
    pub async fn mark_failure(&self, route_id: &str, reason: &str) {
        self.mark_failure_at(route_id, reason, Utc::now()).await;
    }

    pub async fn mark_failure_at(&self, route_id: &str, reason: &str, now: DateTime<Utc>) {
        let stats = {
            let mut entries = self.entries.write().await;
            let Some(route) = find_route(&mut entries, route_id) else {
                debug!(route = route_id, "Failure reported for unknown route");
                return;
            };
            route.consecutive_failures += 1;
            route.failure_count += 1;
            route.last_failure_reason = Some(truncate_text(reason, 200));

            if route.health == RouteHealth::Active
                && route.consecutive_failures >= self.failure_threshold
            {
                route.health = RouteHealth::Suspended;
                route.suspended_until = Some(now + self.cooldown);
                warn!(
                    route = %route.id(),
                    consecutive_failures = route.consecutive_failures,
                    until = ?route.suspended_until,
                    "Proxy route suspended"
                );
                metrics::record_proxy_outcome("suspended");
            } else {
                debug!(
                    route = %route.id(),
                    consecutive_failures = route.consecutive_failures,
                    reason = reason,
                    "Proxy route failure"
                );
            }
            RouteStats::from_route(route, now)
        };
        metrics::record_proxy_outcome("failure");
        self.persist(stats);
    }

    /// Exclude the route from selection for `duration`
    pub async fn mark_rate_limited(&self, route_id: &str, duration: Duration) {
        self.mark_rate_limited_at(route_id, duration, Utc::now()).await;
    }

    pub async fn mark_rate_limited_at(&self, route_id: &str, duration: Duration, now: DateTime<Utc>) {
        let stats = {
            let mut entries = self.entries.write().await;
            let Some(route) = find_route(&mut entries, route_id) else {
                return;
            };
            let window = chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            route.rate_limited_until = Some(now + window);
            info!(
                route = %route.id(),
                until = ?route.rate_limited_until,
                "Proxy route rate limited"
            );
            RouteStats::from_route(route, now)
        };
        metrics::record_proxy_outcome("rate_limited");
        self.persist(stats);
    }

    /// Reactivate routes whose cooldown has elapsed and re-sync the list.
    ///
    /// Routes that survive the re-sync keep their counters; clients already
    /// handed out stay valid even if their route is dropped.
    pub async fn refresh(&self) -> RefreshReport {
        self.refresh_at(Utc::now()).await
    }

    pub async fn refresh_at(&self, now: DateTime<Utc>) -> RefreshReport {
        let parsed = match self.source.load() {
            Ok(list) => match parse_proxy_list(&list) {
                Ok(routes) => Some(routes),
                Err(e) => {
                    warn!(error = %e, "Proxy list invalid, keeping current routes");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Proxy list unavailable, keeping current routes");
                None
            }
        };

        let mut report = RefreshReport::default();
        let mut changed = Vec::new();
        let mut entries = self.entries.write().await;

        for entry in entries.iter_mut() {
            let route = &mut entry.route;
            if route.cooldown_elapsed_at(now) {
                route.health = RouteHealth::Active;
                route.consecutive_failures = 0;
                route.suspended_until = None;
                report.reactivated.push(route.id().to_string());
                changed.push(RouteStats::from_route(route, now));
            }
            if route.rate_limited_until.is_some_and(|until| until <= now) {
                route.rate_limited_until = None;
            }
        }

        if let Some(routes) = parsed {
            let mut next = Vec::with_capacity(routes.len());
            for route in routes {
                if let Some(pos) = entries.iter().position(|e| e.route.id() == route.id()) {
                    next.push(entries.swap_remove(pos));
                    continue;
                }
                let id = route.id().to_string();
                match build_entry(route, self.request_timeout) {
                    Ok(entry) => {
                        report.added.push(id);
                        next.push(entry);
                    }
                    Err(e) => warn!(error = %e, "Skipping proxy route"),
                }
            }
            report.removed = entries.iter().map(|e| e.route.id().to_string()).collect();
            *entries = next;
        }
        drop(entries);

        if !report.reactivated.is_empty() || !report.added.is_empty() || !report.removed.is_empty() {
            info!(
                reactivated = report.reactivated.len(),
                added = report.added.len(),
                removed = report.removed.len(),
                "Proxy pool refreshed"
            );
        }
        for stats in changed {
            self.persist(stats);
        }

        report
    }

    /// Run `refresh` on the configured interval until shutdown
    pub fn start_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.refresh_interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.refresh().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Proxy refresh loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Snapshot of all routes
    pub async fn routes(&self) -> Vec<ProxyRoute> {
        self.entries.read().await.iter().map(|e| e.route.clone()).collect()
    }

    /// Snapshot of one route
    pub async fn route(&self, route_id: &str) -> Option<ProxyRoute> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.route.id() == route_id)
            .map(|e| e.route.clone())
    }

    /// Number of routes selectable right now
    pub async fn eligible_count(&self) -> usize {
        let now = Utc::now();
        eligible_indices(&self.entries.read().await, now).count()
    }

    fn select_round_robin(&self, entries: &[RouteEntry], now: DateTime<Utc>) -> Option<usize> {
        let len = entries.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % len;
        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| entries[i].route.is_eligible_at(now))?;
        self.cursor.store(index + 1, Ordering::Relaxed);
        Some(index)
    }

    fn persist(&self, stats: RouteStats) {
        let Some(store) = self.stats.as_ref().map(Arc::clone) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn_blocking(move || {
            if let Err(e) = store.record(&stats) {
                warn!(route = %stats.route_id, error = %e, "Failed to persist proxy stats");
            }
        });
    }
}

fn eligible_indices(entries: &[RouteEntry], now: DateTime<Utc>) -> impl Iterator<Item = usize> + '_ {
    entries
        .iter()
        .enumerate()
        .filter(move |(_, e)| e.route.is_eligible_at(now))
        .map(|(i, _)| i)
}

fn find_route<'a>(entries: &'a mut [RouteEntry], route_id: &str) -> Option<&'a mut ProxyRoute> {
    entries
        .iter_mut()
        .find(|e| e.route.id() == route_id)
        .map(|e| &mut e.route)
}

fn build_entry(route: ProxyRoute, timeout: Duration) -> Result<RouteEntry, ProxyError> {
    let client_error = |reason: &str| ProxyError::ClientBuild {
        route: route.id().to_string(),
        reason: reason.to_string(),
    };

    let proxy = reqwest::Proxy::all(route.url()).map_err(|_| client_error("invalid proxy URL"))?;
    let client = Client::builder()
        .timeout(timeout)
        .proxy(proxy)
        .build()
        .map_err(|_| client_error("client builder rejected route"))?;

    Ok(RouteEntry { route, client })
}
