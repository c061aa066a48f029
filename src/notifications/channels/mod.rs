//! Notification channels for delivering messages
//!
//! A channel makes a single delivery attempt. Retries, backoff and drop
//! decisions belong to the [`NotificationQueue`](super::NotificationQueue).

pub mod log;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::notifications::Notification;

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur during channel operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Transport failure (connect, timeout)
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Invalid channel configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel temporarily unavailable
    #[error("Channel temporarily unavailable: {0}")]
    Unavailable(String),

    /// Target is rate limiting us
    #[error("Rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Target refused the message
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl ChannelError {
    /// Worth re-enqueuing
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Unavailable(_) | Self::RateLimited { .. }
        )
    }
}

/// Response from sending a notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    /// Channel that delivered the notification
    pub channel: String,
    /// Optional message about the delivery
    pub message: Option<String>,
    /// Timestamp of delivery
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DeliveryStatus {
    /// Create a delivery status
    pub fn delivered(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a delivery status with a message
    pub fn delivered_with_message(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[DELIVERED] {}", self.channel)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Trait for notification channels
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &str;

    /// Make one delivery attempt
    async fn send(&self, notification: &Notification) -> ChannelResult<DeliveryStatus>;
}
