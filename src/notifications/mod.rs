//! User notifications: admission control and asynchronous delivery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   can_send   ┌─────────────────────┐
//! │    CheckScheduler    │─────────────▶│ NotificationLimiter │
//! └──────────────────────┘              │ - per-type cooldown │
//!            │ submit                   │ - hourly/daily caps │
//!            ▼                          │ - min spacing       │
//! ┌──────────────────────┐              │ - adaptive backoff  │
//! │  NotificationQueue   │              └─────────────────────┘
//! │  FIFO, 1s drain loop │
//! └──────────────────────┘
//!            │ send
//!   ┌────────┴────────┐
//!   ▼                 ▼
//! ┌─────────┐   ┌─────────┐
//! │ Webhook │   │   Log   │
//! │ Channel │   │ Channel │
//! └─────────┘   └─────────┘
//! ```
//!
//! Denied notifications are never silently dropped: every denial is counted,
//! logged and kept in a bounded audit ring (optionally persisted).

mod admin;
pub mod channels;
pub mod limiter;
pub mod queue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// Re-exports
pub use admin::AdminNotifier;
pub use channels::log::LogChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::{ChannelError, DeliveryStatus, NotificationChannel};
pub use limiter::{Admission, DenialLog, DenialReason, DenialRecord, NotificationLimiter};
pub use queue::{DeliveryOutcome, DrainReport, NotificationQueue};

/// Kind of notification, each with its own admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// Account ban status changed
    StatusChange,
    /// Periodic summary
    DailyUpdate,
    /// Check-level error surfaced to the owner
    Error,
    /// Account checks disabled
    AccountDisabled,
}

impl NotificationType {
    pub const ALL: [NotificationType; 4] = [
        Self::StatusChange,
        Self::DailyUpdate,
        Self::Error,
        Self::AccountDisabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::DailyUpdate => "daily_update",
            Self::Error => "error",
            Self::AccountDisabled => "account_disabled",
        }
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown notification type: {s}"))
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_key: String,
    pub kind: NotificationType,
    pub message: String,

    /// Account the message is about, if any
    pub account_id: Option<String>,

    /// Delivery attempts already re-enqueued
    pub retries: u32,

    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_key: impl Into<String>, kind: NotificationType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_key: user_key.into(),
            kind,
            message: message.into(),
            account_id: None,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    pub fn for_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Admission and queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// Refused by the limiter
    #[error("Notification {kind} for {user_key} denied: {reason}")]
    Denied {
        user_key: String,
        kind: NotificationType,
        reason: DenialReason,
    },

    /// Denial audit store failure
    #[error("Denial log failed: {0}")]
    Store(String),
}
