//! banwatch - distributed ban-status checker
//!
//! Workers split the monitored user population between themselves, send
//! status requests through a rotating proxy pool, solve the challenge in front
//! of the status endpoint through a captcha vendor, and notify users of status
//! changes under per-user admission limits.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration schema and loading
//! - [`shard`] - Shard registration, heartbeats and user partitioning
//! - [`proxy`] - Egress route pool with circuit breaking
//! - [`captcha`] - Vendor task API client and solver selection
//! - [`scheduler`] - Due-check policy, check execution and the worker runtime
//! - [`notifications`] - Admission limiter, delivery queue and channels
//! - [`storage`] - SQLite persistence for shards, route stats and denials
//! - [`metrics`] - Prometheus metrics
//! - [`server`] - Health and metrics HTTP surface
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use banwatch::config::Config;
//! use banwatch::scheduler::Worker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let worker = Worker::build(config).await?;
//!     let handle = worker.start();
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod captcha;
pub mod config;
pub mod error;
pub mod metrics;
pub mod notifications;
pub mod proxy;
pub mod scheduler;
pub mod server;
pub mod shard;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::captcha::{CaptchaSolver, ProviderKind, SolverPreference, SolverRegistry};
    pub use crate::config::Config;
    pub use crate::error::{BanwatchErrorTrait, Error, ErrorCategory, Result};
    pub use crate::notifications::{Notification, NotificationLimiter, NotificationQueue, NotificationType};
    pub use crate::proxy::ProxyPool;
    pub use crate::scheduler::{BanStatus, CheckScheduler, MonitoredAccount, Worker};
    pub use crate::shard::ShardPartitioner;
    pub use crate::storage::Database;
}
