//! Account check scheduling
//!
//! # Overview
//!
//! Every tick the scheduler lists accounts, keeps the ones this shard owns,
//! applies the due-check policy and checks the due ones concurrently.
//!
//! # Architecture
//!
//! ```text
//!  tick ──▶ AccountStore::list_accounts
//!                 │
//!                 ▼
//!   ShardPartitioner::belongs_to_this_instance ──▶ DuePolicy::should_check
//!                 │
//!                 ▼  (buffer_unordered, max_concurrent_checks)
//!   per-account lock ─▶ SolverRegistry::solve ─▶ ProxyPool::get_client
//!                 │                                      │
//!                 │        status request (governor) ◀───┘
//!                 ▼
//!   write account ─▶ transition record ─▶ NotificationQueue::submit
//! ```
//!
//! # Error policy
//!
//! | Error | Effect |
//! |-------|--------|
//! | network, 429, 5xx | retried locally, then counted |
//! | captcha timeout / vendor error | counted toward `max_consecutive_errors` |
//! | access revoked, balance exhausted, invalid solver key | account disabled at once |
//! | 401 | status `invalid_credential`, account flagged `cookie_expired` |
//!
//! # Modules
//!
//! - [`account`] - Account records and the store seam
//! - [`policy`] - Due-check policy
//! - [`check`] - Check execution and the scheduling loop
//! - [`runner`] - Worker wiring and background tasks
//! - [`error`] - Check error taxonomy

pub mod account;
pub mod check;
pub mod error;
pub mod policy;
pub mod runner;

// Re-export main types
pub use account::{
    AccountStore, BanStatus, InMemoryAccountStore, MonitoredAccount, StatusTransition, UserSettings,
};
pub use check::{CheckOutcome, CheckScheduler, CycleReport};
pub use error::{CheckError, CheckResult, DisableReason};
pub use policy::DuePolicy;
pub use runner::{Worker, WorkerHandle};
