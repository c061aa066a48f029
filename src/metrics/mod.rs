//! Prometheus metrics for the check worker
//!
//! This module tracks:
//! - Sharding: active shard count
//! - Proxies: route outcomes (success, failure, suspension, rate limiting, direct fallback)
//! - Captcha: solve outcomes and durations per provider
//! - Checks: outcomes and durations
//! - Notifications: sent, denied, dropped, queue depth
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

// ============================================================================
// Metrics Storage
// ============================================================================

struct WorkerMetrics {
    active_shards: Gauge,
    proxy_outcomes: CounterVec,
    captcha_solves: CounterVec,
    captcha_duration: HistogramVec,
    checks: CounterVec,
    check_duration: Histogram,
    notifications_sent: CounterVec,
    notifications_denied: CounterVec,
    notifications_dropped: CounterVec,
    queue_depth: Gauge,
}

static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

/// Serializes registration so concurrent callers see a finished init
static INIT_LOCK: Mutex<()> = Mutex::new(());

// ============================================================================
// Initialization
// ============================================================================

/// Register all metrics with the default registry
///
/// Idempotent. On failure the error is returned and every recording
/// function stays a no-op.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = WorkerMetrics {
        active_shards: register_gauge!(
            "banwatch_active_shards",
            "Active shard count used as the partition modulus"
        )?,
        proxy_outcomes: register_counter_vec!(
            "banwatch_proxy_outcomes_total",
            "Proxy route outcomes",
            &["outcome"]
        )?,
        captcha_solves: register_counter_vec!(
            "banwatch_captcha_solves_total",
            "Captcha solve attempts by provider and outcome",
            &["provider", "outcome"]
        )?,
        captcha_duration: register_histogram_vec!(
            "banwatch_captcha_solve_duration_seconds",
            "Time spent solving a captcha",
            &["provider"],
            vec![1.0, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 90.0, 120.0]
        )?,
        checks: register_counter_vec!(
            "banwatch_checks_total",
            "Account checks by outcome",
            &["outcome"]
        )?,
        check_duration: register_histogram!(
            "banwatch_check_duration_seconds",
            "End-to-end account check duration",
            vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )?,
        notifications_sent: register_counter_vec!(
            "banwatch_notifications_sent_total",
            "Delivered notifications by type",
            &["type"]
        )?,
        notifications_denied: register_counter_vec!(
            "banwatch_notifications_denied_total",
            "Notifications refused by the limiter",
            &["type", "reason"]
        )?,
        notifications_dropped: register_counter_vec!(
            "banwatch_notifications_dropped_total",
            "Notifications dropped after failed delivery",
            &["type"]
        )?,
        queue_depth: register_gauge!(
            "banwatch_notification_queue_depth",
            "Notifications waiting for delivery"
        )?,
    };

    WORKER_METRICS
        .set(metrics)
        .map_err(|_| "Worker metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    WORKER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn set_active_shards(total: u32) {
    if let Some(m) = WORKER_METRICS.get() {
        m.active_shards.set(f64::from(total));
    }
}

pub fn record_proxy_outcome(outcome: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.proxy_outcomes.with_label_values(&[outcome]).inc();
    }
}

pub fn record_captcha_solve(provider: &str, outcome: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.captcha_solves.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn record_check(outcome: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.checks.with_label_values(&[outcome]).inc();
    }
}

pub fn record_notification_sent(kind: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.notifications_sent.with_label_values(&[kind]).inc();
    }
}

pub fn record_notification_denied(kind: &str, reason: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.notifications_denied.with_label_values(&[kind, reason]).inc();
    }
}

pub fn record_notification_dropped(kind: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.notifications_dropped.with_label_values(&[kind]).inc();
    }
}

pub fn set_queue_depth(depth: usize) {
    if let Some(m) = WORKER_METRICS.get() {
        m.queue_depth.set(depth as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct Timer {
    timer: Option<prometheus::HistogramTimer>,
}

impl Timer {
    /// Captcha solve timer for a provider
    pub fn captcha(provider: &str) -> Self {
        Self {
            timer: WORKER_METRICS
                .get()
                .map(|m| m.captcha_duration.with_label_values(&[provider]).start_timer()),
        }
    }

    /// Account check timer
    pub fn check() -> Self {
        Self {
            timer: WORKER_METRICS.get().map(|m| m.check_duration.start_timer()),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
