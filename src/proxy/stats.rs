//! Route outcome persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::route::{ProxyRoute, RouteHealth};
use super::ProxyError;

/// Persisted snapshot of one route, keyed by the masked id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    pub route_id: String,
    pub health: RouteHealth,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RouteStats {
    pub fn from_route(route: &ProxyRoute, updated_at: DateTime<Utc>) -> Self {
        Self {
            route_id: route.id().to_string(),
            health: route.health,
            consecutive_failures: route.consecutive_failures,
            success_count: route.success_count,
            failure_count: route.failure_count,
            last_used: route.last_used,
            rate_limited_until: route.rate_limited_until,
            suspended_until: route.suspended_until,
            last_failure_reason: route.last_failure_reason.clone(),
            updated_at,
        }
    }
}

/// Storage seam for route outcomes. Called from a blocking task.
pub trait ProxyStatsStore: Send + Sync {
    fn record(&self, stats: &RouteStats) -> Result<(), ProxyError>;
}
