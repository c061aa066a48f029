//! Channel that writes notifications to the log

use async_trait::async_trait;
use tracing::info;

use super::{ChannelResult, DeliveryStatus, NotificationChannel};
use crate::notifications::Notification;

/// Delivers by logging; used when no webhook is configured
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> ChannelResult<DeliveryStatus> {
        info!(
            id = %notification.id,
            user_key = %notification.user_key,
            kind = %notification.kind,
            account_id = ?notification.account_id,
            message = %notification.message,
            "Notification"
        );
        Ok(DeliveryStatus::delivered("log"))
    }
}
