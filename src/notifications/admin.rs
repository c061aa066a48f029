//! Throttled operator notices

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

use super::{Notification, NotificationChannel, NotificationType};
use crate::config::MAX_INTERVAL_SECS;

const ADMIN_USER_KEY: &str = "admin";

/// Forwards check-layer errors to an admin channel, one per key per window
pub struct AdminNotifier {
    channel: Option<Arc<dyn NotificationChannel>>,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
    dedup_window: Duration,
}

impl AdminNotifier {
    pub fn new(channel: Option<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            channel,
            last_sent: Mutex::new(HashMap::new()),
            dedup_window: Duration::minutes(30),
        }
    }

    /// Notices dropped to the log only
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn with_dedup_window(mut self, minutes: i64) -> Self {
        let max_minutes = (MAX_INTERVAL_SECS / 60) as i64;
        self.dedup_window = Duration::minutes(minutes.clamp(0, max_minutes));
        self
    }

    /// Send unless the same key fired inside the window. Returns whether a
    /// notice went out.
    pub async fn notify(&self, key: &str, message: &str) -> bool {
        self.notify_at(key, message, Utc::now()).await
    }

    pub async fn notify_at(&self, key: &str, message: &str, now: DateTime<Utc>) -> bool {
        {
            let mut last_sent = self.last_sent.lock().await;
            if last_sent
                .get(key)
                .is_some_and(|&at| now - at < self.dedup_window)
            {
                return false;
            }
            last_sent.insert(key.to_string(), now);
            last_sent.retain(|_, at| now - *at < self.dedup_window);
        }

        warn!(key = key, message = message, "Admin notice");

        let Some(channel) = &self.channel else {
            return true;
        };
        let notice = Notification::new(ADMIN_USER_KEY, NotificationType::Error, message);
        if let Err(e) = channel.send(&notice).await {
            error!(key = key, channel = %channel.name(), error = %e, "Failed to deliver admin notice");
        }
        true
    }
}
