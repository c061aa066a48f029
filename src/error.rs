//! Unified error handling for the banwatch crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`BanwatchErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use banwatch::error::{Error, BanwatchErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), "Retrying: {err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::captcha::CaptchaError;
pub use crate::notifications::channels::ChannelError;
pub use crate::notifications::NotificationError;
pub use crate::proxy::ProxyError;
pub use crate::scheduler::error::CheckError;
pub use crate::shard::ShardError;

/// Common trait for banwatch error types
///
/// Gives callers one place to decide between retrying and giving up.
pub trait BanwatchErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, rate limit)
    Network,
    /// Captcha vendor errors
    Captcha,
    /// Proxy configuration and routing errors
    Proxy,
    /// Shard registry and partitioning errors
    Shard,
    /// Notification admission and delivery errors
    Notification,
    /// Account check errors
    Check,
    /// Storage and I/O errors
    Storage,
    /// Parsing of vendor or endpoint payloads
    Parsing,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short lowercase label, used as a metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Captcha => "captcha",
            Self::Proxy => "proxy",
            Self::Shard => "shard",
            Self::Notification => "notification",
            Self::Check => "check",
            Self::Storage => "storage",
            Self::Parsing => "parsing",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the banwatch crate
#[derive(Error, Debug)]
pub enum Error {
    /// Shard registration and partitioning errors
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    /// Proxy pool errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Captcha solving errors
    #[error("Captcha error: {0}")]
    Captcha(#[from] CaptchaError),

    /// Account check errors
    #[error("Check error: {0}")]
    Check(#[from] CheckError),

    /// Notification admission errors
    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    /// Notification delivery errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BanwatchErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Shard(e) => e.is_recoverable(),
            Self::Proxy(e) => e.is_recoverable(),
            Self::Captcha(e) => e.is_recoverable(),
            Self::Check(e) => e.is_recoverable(),
            Self::Notification(_) => false,
            Self::Channel(e) => e.is_recoverable(),
            Self::Database(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Shard(ShardError::InvalidShardIndex { .. })
            | Self::Shard(ShardError::InvalidTotalShards(_)) => ErrorCategory::Config,
            Self::Shard(_) => ErrorCategory::Shard,
            Self::Proxy(ProxyError::InvalidRoute { .. }) => ErrorCategory::Config,
            Self::Proxy(_) => ErrorCategory::Proxy,
            Self::Captcha(CaptchaError::Network(_)) => ErrorCategory::Network,
            Self::Captcha(CaptchaError::MalformedResponse(_)) => ErrorCategory::Parsing,
            Self::Captcha(_) => ErrorCategory::Captcha,
            Self::Check(CheckError::Network(_)) => ErrorCategory::Network,
            Self::Check(_) => ErrorCategory::Check,
            Self::Notification(_) | Self::Channel(_) => ErrorCategory::Notification,
            Self::Http(_) => ErrorCategory::Network,
            Self::Database(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
