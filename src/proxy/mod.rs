//! Egress proxy pool
//!
//! Selects a route per outbound request, tracks outcomes, suspends routes
//! that keep failing and falls back to a direct connection when nothing is
//! eligible. Raw proxy URLs stay inside [`ProxyRoute`]; logs, errors and the
//! stats store only ever see the masked route id.

pub mod pool;
pub mod route;
pub mod source;
pub mod stats;

pub use pool::{PooledClient, ProxyPool, RefreshReport, SelectionStrategy};
pub use route::{parse_proxy_list, ProxyRoute, RouteHealth};
pub use source::{source_for, EnvSource, ProxyListSource, StaticSource};
pub use stats::{ProxyStatsStore, RouteStats};

use thiserror::Error;

/// Proxy pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Malformed proxy entry (credentials already redacted)
    #[error("Invalid proxy entry {entry}: {reason}")]
    InvalidRoute { entry: String, reason: String },

    /// The proxy list could not be loaded
    #[error("Proxy list source failed: {0}")]
    Source(String),

    /// reqwest refused to build a client for a route
    #[error("Failed to build client for {route}: {reason}")]
    ClientBuild { route: String, reason: String },

    /// Stats persistence failed
    #[error("Proxy stats store failed: {0}")]
    Stats(String),
}

impl ProxyError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Stats(_))
    }
}
