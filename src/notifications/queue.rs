//! FIFO delivery queue with bounded re-enqueue
//!
//! Accepted notifications are drained by a single background loop. A
//! recoverable channel failure raises the user's backoff and puts the item
//! back at the tail with `retries + 1`; once `max_retries` is reached the
//! item is dropped with a warning.
//!
//! When the channel answers "rate limited" for a user, that user's items are
//! held until the `Retry-After` instant. Held items cycle to the tail without
//! a send and without spending a retry.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Admission, ChannelError, Notification, NotificationChannel, NotificationError, NotificationLimiter};
use crate::config::NotificationConfig;
use crate::metrics;

/// Hold applied when a rate-limited answer carries no `Retry-After`
const DEFAULT_RATE_LIMIT_HOLD_SECS: i64 = 60;

/// What happened to one dequeued item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Requeued,
    Dropped,

    /// Target still rate limited; put back untouched
    Deferred,
}

/// Totals for one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub deferred: usize,
}

impl DrainReport {
    /// Items that reached the channel
    pub fn processed(&self) -> usize {
        self.delivered + self.requeued + self.dropped
    }

    fn add(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Requeued => self.requeued += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
            DeliveryOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// Notification queue feeding one channel
pub struct NotificationQueue {
    items: Mutex<VecDeque<Notification>>,
    held_until: Mutex<HashMap<String, DateTime<Utc>>>,
    limiter: Arc<NotificationLimiter>,
    channel: Arc<dyn NotificationChannel>,
    max_retries: u32,
    poll_interval: Duration,
    batch_size: usize,
    rate_limit_hold: chrono::Duration,
}

impl NotificationQueue {
    pub fn new(limiter: Arc<NotificationLimiter>, channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            held_until: Mutex::new(HashMap::new()),
            limiter,
            channel,
            max_retries: 3,
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            rate_limit_hold: chrono::Duration::seconds(DEFAULT_RATE_LIMIT_HOLD_SECS),
        }
    }

    pub fn from_config(
        config: &NotificationConfig,
        limiter: Arc<NotificationLimiter>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self::new(limiter, channel)
            .with_max_retries(config.max_delivery_retries)
            .with_poll_interval(Duration::from_millis(config.queue_poll_interval_ms))
            .with_batch_size(config.queue_batch_size)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Hold used when the channel gives no `Retry-After`
    pub fn with_rate_limit_hold(mut self, hold: Duration) -> Self {
        self.rate_limit_hold = chrono::Duration::from_std(hold).unwrap_or(self.rate_limit_hold);
        self
    }

    pub fn limiter(&self) -> &Arc<NotificationLimiter> {
        &self.limiter
    }

    /// Run admission control, then enqueue
    pub async fn submit(&self, notification: Notification, self_funded: bool) -> Result<(), NotificationError> {
        let admission = self
            .limiter
            .admit_at(&notification.user_key, notification.kind, self_funded, Utc::now())
            .await;

        match admission {
            Admission::Allowed => {
                self.enqueue(notification).await;
                Ok(())
            }
            Admission::Denied(reason) => Err(NotificationError::Denied {
                user_key: notification.user_key,
                kind: notification.kind,
                reason,
            }),
        }
    }

    /// Append without admission control
    pub async fn enqueue(&self, notification: Notification) {
        let mut items = self.items.lock().await;
        items.push_back(notification);
        metrics::set_queue_depth(items.len());
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Instant until which deliveries to `user_key` are held
    pub async fn held_until(&self, user_key: &str) -> Option<DateTime<Utc>> {
        self.held_until.lock().await.get(user_key).copied()
    }

    /// True while the user's target is inside a rate-limit hold
    async fn is_held(&self, user_key: &str, now: DateTime<Utc>) -> bool {
        let mut held = self.held_until.lock().await;
        match held.get(user_key) {
            Some(&until) if until > now => true,
            Some(_) => {
                held.remove(user_key);
                false
            }
            None => false,
        }
    }

    async fn hold(&self, user_key: &str, retry_after_secs: Option<u64>, now: DateTime<Utc>) {
        let hold = retry_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(self.rate_limit_hold);
        let until = now.checked_add_signed(hold).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.held_until.lock().await.insert(user_key.to_string(), until);
        debug!(user_key = user_key, until = %until, "Deliveries held after rate limit");
    }

    /// Deliver the head of the queue, if any
    pub async fn process_next(&self) -> Option<DeliveryOutcome> {
        self.process_next_at(Utc::now()).await
    }

    pub async fn process_next_at(&self, now: DateTime<Utc>) -> Option<DeliveryOutcome> {
        let notification = {
            let mut items = self.items.lock().await;
            let next = items.pop_front();
            metrics::set_queue_depth(items.len());
            next
        }?;

        if self.is_held(&notification.user_key, now).await {
            self.enqueue(notification).await;
            return Some(DeliveryOutcome::Deferred);
        }

        let outcome = match self.channel.send(&notification).await {
            Ok(status) => {
                metrics::record_notification_sent(notification.kind.as_str());
                debug!(
                    id = %notification.id,
                    user_key = %notification.user_key,
                    kind = %notification.kind,
                    status = %status,
                    "Notification delivered"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) if e.is_recoverable() => {
                self.limiter
                    .record_delivery_failure_at(&notification.user_key, now)
                    .await;
                if let ChannelError::RateLimited { retry_after_secs } = &e {
                    self.hold(&notification.user_key, *retry_after_secs, now).await;
                }

                if notification.retries < self.max_retries {
                    let mut retry = notification;
                    retry.retries += 1;
                    debug!(
                        id = %retry.id,
                        retries = retry.retries,
                        error = %e,
                        "Notification re-enqueued"
                    );
                    self.enqueue(retry).await;
                    DeliveryOutcome::Requeued
                } else {
                    warn!(
                        id = %notification.id,
                        user_key = %notification.user_key,
                        kind = %notification.kind,
                        retries = notification.retries,
                        error = %e,
                        "Dropping notification after max retries"
                    );
                    metrics::record_notification_dropped(notification.kind.as_str());
                    DeliveryOutcome::Dropped
                }
            }
            Err(e) => {
                warn!(
                    id = %notification.id,
                    user_key = %notification.user_key,
                    kind = %notification.kind,
                    error = %e,
                    "Dropping undeliverable notification"
                );
                metrics::record_notification_dropped(notification.kind.as_str());
                DeliveryOutcome::Dropped
            }
        };

        Some(outcome)
    }

    /// Process up to one batch of the items queued when the pass began
    pub async fn drain_once(&self) -> DrainReport {
        self.drain_once_at(Utc::now()).await
    }

    pub async fn drain_once_at(&self, now: DateTime<Utc>) -> DrainReport {
        let budget = self.len().await.min(self.batch_size);
        let mut report = DrainReport::default();

        for _ in 0..budget {
            match self.process_next_at(now).await {
                Some(outcome) => report.add(outcome),
                None => break,
            }
        }
        report
    }

    /// Start the drain loop
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                channel = %self.channel.name(),
                interval_ms = self.poll_interval.as_millis() as u64,
                "Notification queue started"
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.drain_once().await;
                        if report.processed() > 0 {
                            debug!(
                                delivered = report.delivered,
                                requeued = report.requeued,
                                dropped = report.dropped,
                                "Notification drain pass"
                            );
                        }
                    }
                    _ = shutdown.changed() => {
                        let pending = self.len().await;
                        info!(pending = pending, "Notification queue shutting down");
                        break;
                    }
                }
            }
        })
    }
}
