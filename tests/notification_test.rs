//! Notification admission and delivery end to end
//!
//! Limiter, queue and webhook channel wired together against a wiremock
//! receiver, with denials persisted to SQLite.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use banwatch::config::NotificationConfig;
use banwatch::notifications::{
    Admission, DeliveryOutcome, DenialReason, Notification, NotificationError, NotificationLimiter,
    NotificationQueue, NotificationType, WebhookChannel,
};
use banwatch::storage::Database;

async fn webhook_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn queue_for(server: &MockServer) -> (Arc<NotificationLimiter>, NotificationQueue) {
    let limiter = Arc::new(NotificationLimiter::from_config(&NotificationConfig::default()));
    let channel = WebhookChannel::from_url(format!("{}/notify", server.uri()))
        .unwrap()
        .named("user_webhook");
    let queue = NotificationQueue::new(Arc::clone(&limiter), Arc::new(channel));
    (limiter, queue)
}

fn status_change(user: &str) -> Notification {
    Notification::new(user, NotificationType::StatusChange, "Account acc-1 is now permanently banned")
        .for_account("acc-1")
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_admitted_notifications_reach_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(serde_json::json!({"type": "status_change", "account_id": "acc-1"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let (_limiter, queue) = queue_for(&server);
    queue.submit(status_change("user-a"), false).await.unwrap();
    queue.submit(status_change("user-b"), false).await.unwrap();

    // Same user again inside the cooldown
    let err = queue.submit(status_change("user-a"), false).await.unwrap_err();
    assert!(matches!(
        err,
        NotificationError::Denied {
            reason: DenialReason::Cooldown,
            ..
        }
    ));

    let report = queue.drain_once().await;
    assert_eq!(report.delivered, 2);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_unavailable_webhook_requeues_then_drops() {
    let server = webhook_server(503).await;
    let (limiter, queue) = queue_for(&server);
    let queue = queue.with_max_retries(2);

    queue.submit(status_change("user-a"), false).await.unwrap();

    assert_eq!(queue.process_next().await, Some(DeliveryOutcome::Requeued));
    assert_eq!(queue.process_next().await, Some(DeliveryOutcome::Requeued));
    assert_eq!(queue.process_next().await, Some(DeliveryOutcome::Dropped));
    assert_eq!(queue.process_next().await, None);

    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    // Each failed attempt doubles the user's spacing
    assert_eq!(limiter.backoff_multiplier("user-a").await, 8);
    assert_eq!(limiter.effective_spacing("user-a").await, ChronoDuration::minutes(40));
}

#[tokio::test]
async fn test_retry_after_holds_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "60"))
        .mount(&server)
        .await;

    let (_limiter, queue) = queue_for(&server);
    queue.submit(status_change("user-a"), false).await.unwrap();

    let mut reports = Vec::new();
    for _ in 0..4 {
        reports.push(queue.drain_once().await);
    }

    assert_eq!(reports[0].requeued, 1);
    assert!(reports[1..].iter().all(|r| r.deferred == 1 && r.processed() == 0));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(queue.len().await, 1);

    let held = queue.held_until("user-a").await.unwrap();
    assert!(held > Utc::now() + ChronoDuration::seconds(50));
}

#[tokio::test]
async fn test_rejected_webhook_is_not_retried() {
    let server = webhook_server(400).await;
    let (limiter, queue) = queue_for(&server);

    queue.submit(status_change("user-a"), false).await.unwrap();
    assert_eq!(queue.process_next().await, Some(DeliveryOutcome::Dropped));
    assert!(queue.is_empty().await);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(limiter.backoff_multiplier("user-a").await, 1);
}

#[tokio::test]
async fn test_background_drain_stops_on_shutdown() {
    let server = webhook_server(200).await;
    let (_limiter, queue) = queue_for(&server);
    let queue = Arc::new(queue.with_poll_interval(Duration::from_millis(10)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = Arc::clone(&queue).start(shutdown_rx);

    queue.submit(status_change("user-a"), false).await.unwrap();

    let mut delivered = false;
    for _ in 0..100 {
        if server.received_requests().await.unwrap().len() == 1 {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered, "queue loop never delivered");

    shutdown_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("queue loop did not stop")
        .unwrap();
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_cooldown_timeline() {
    let limiter = NotificationLimiter::from_config(&NotificationConfig::default());
    let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    let kind = NotificationType::StatusChange;

    assert_eq!(limiter.admit_at("u", kind, false, t).await, Admission::Allowed);
    assert_eq!(
        limiter.admit_at("u", kind, false, t + ChronoDuration::minutes(10)).await,
        Admission::Denied(DenialReason::Cooldown)
    );
    assert_eq!(
        limiter.admit_at("u", kind, false, t + ChronoDuration::minutes(31)).await,
        Admission::Allowed
    );

    // Other users are unaffected
    assert_eq!(
        limiter.admit_at("v", kind, false, t + ChronoDuration::minutes(10)).await,
        Admission::Allowed
    );
}

#[tokio::test]
async fn test_account_disabled_notice_bypasses_limits() {
    let limiter = NotificationLimiter::from_config(&NotificationConfig::default());
    let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

    assert!(limiter
        .admit_at("u", NotificationType::StatusChange, false, t)
        .await
        .is_allowed());
    assert!(limiter
        .admit_at("u", NotificationType::AccountDisabled, false, t + ChronoDuration::seconds(1))
        .await
        .is_allowed());
}

#[tokio::test]
async fn test_denials_are_persisted_to_sqlite() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(dir.path().join("notify.db")).unwrap());
    let limiter = NotificationLimiter::from_config(&NotificationConfig::default()).with_denial_log(db.clone());
    let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

    limiter.admit_at("u", NotificationType::Error, false, t).await;
    limiter
        .admit_at("u", NotificationType::Error, false, t + ChronoDuration::minutes(1))
        .await;
    limiter
        .admit_at("u", NotificationType::StatusChange, false, t + ChronoDuration::minutes(2))
        .await;

    assert_eq!(limiter.denial_count(NotificationType::Error, DenialReason::Cooldown), 1);
    assert_eq!(
        limiter.denial_count(NotificationType::StatusChange, DenialReason::MinSpacing),
        1
    );

    let mut counts = Vec::new();
    for _ in 0..50 {
        counts = db.denial_counts().unwrap();
        if counts.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    counts.sort();
    assert_eq!(
        counts,
        vec![
            ("error".to_string(), "cooldown".to_string(), 1),
            ("status_change".to_string(), "min_spacing".to_string(), 1),
        ]
    );
}
