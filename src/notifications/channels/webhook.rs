//! Webhook notification channel
//!
//! Sends notifications as JSON payloads via HTTP POST.
//!
//! # Payload Format
//!
//! ```json
//! {
//!   "id": "notification-uuid",
//!   "user_key": "user-42",
//!   "type": "status_change",
//!   "message": "Account acc-1 is now permanently banned",
//!   "account_id": "acc-1",
//!   "retries": 0,
//!   "created_at": "2024-01-01T12:00:00Z"
//! }
//! ```

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChannelError, ChannelResult, DeliveryStatus, NotificationChannel};
use crate::notifications::Notification;

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL endpoint
    pub url: String,
    /// Optional authentication token (sent as Bearer token)
    pub auth_token: Option<String>,
    /// Custom headers to include in requests
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    10
}

impl WebhookConfig {
    /// Create a new webhook configuration
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            headers: std::collections::HashMap::new(),
            timeout_secs: default_timeout(),
        }
    }

    /// Set authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Webhook notification channel
pub struct WebhookChannel {
    name: String,
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    /// Create a new webhook channel
    pub fn new(config: WebhookConfig) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChannelError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: "webhook".to_string(),
            config,
            client,
        })
    }

    /// Create a simple webhook channel with just a URL
    pub fn from_url(url: impl Into<String>) -> ChannelResult<Self> {
        Self::new(WebhookConfig::new(url))
    }

    /// Rename the channel (distinguishes user and admin webhooks in logs)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Get the webhook URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(notification: &Notification) -> serde_json::Value {
        serde_json::json!({
            "id": notification.id,
            "user_key": notification.user_key,
            "type": notification.kind.as_str(),
            "message": notification.message,
            "account_id": notification.account_id,
            "retries": notification.retries,
            "created_at": notification.created_at.to_rfc3339(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> ChannelResult<DeliveryStatus> {
        let mut request = self.client.post(&self.config.url);

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request
            .json(&Self::build_payload(notification))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                channel = %self.name,
                id = %notification.id,
                status = %status,
                "Webhook delivered"
            );
            return Ok(DeliveryStatus::delivered_with_message(
                self.name.clone(),
                format!("HTTP {}", status.as_u16()),
            ));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        let detail = format!("HTTP {}: {}", status.as_u16(), crate::utils::truncate_text(&body, 200));

        if status.is_server_error() {
            Err(ChannelError::Unavailable(detail))
        } else {
            Err(ChannelError::Rejected(detail))
        }
    }
}
