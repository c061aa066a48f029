//! Per-user notification admission control
//!
//! Rules, checked in order for a `(user, type)` pair:
//!
//! 1. Critical types are always admitted.
//! 2. The type's cooldown must have elapsed since its last send.
//! 3. The minimum spacing, scaled by the user's backoff multiplier and capped
//!    at `max_backoff`, must have elapsed since any send.
//! 4. Unless the user is self-funded, the type's rolling hourly and daily
//!    caps must not be reached.
//!
//! The multiplier doubles on delivery failures and on repeated spacing
//! denials, and falls back to 1 once the user's recent-send history is empty.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NotificationError, NotificationType};
use crate::config::{interval_secs, NotificationConfig, TypePolicy};
use crate::metrics;

const RECENT_HISTORY_CAP: usize = 32;
const DENIAL_RING_CAP: usize = 512;

// ============================================================================
// Admission Types
// ============================================================================

/// Why a notification was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    Cooldown,
    MinSpacing,
    HourlyCap,
    DailyCap,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cooldown => "cooldown",
            Self::MinSpacing => "min_spacing",
            Self::HourlyCap => "hourly_cap",
            Self::DailyCap => "daily_cap",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limiter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(DenialReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// One audited denial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenialRecord {
    pub user_key: String,
    pub kind: NotificationType,
    pub reason: DenialReason,
    pub at: DateTime<Utc>,
}

/// Storage seam for denial audits. Called from a blocking task.
pub trait DenialLog: Send + Sync {
    fn record(&self, denial: &DenialRecord) -> Result<(), NotificationError>;
}

// ============================================================================
// Settings and State
// ============================================================================

/// Resolved limiter settings
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub policies: HashMap<NotificationType, TypePolicy>,
    pub min_spacing: Duration,
    pub max_backoff: Duration,
    pub history_window: Duration,
    pub suppression_backoff_threshold: u32,
    pub stale_after: Duration,
}

impl LimiterSettings {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            policies: NotificationType::ALL
                .iter()
                .map(|&kind| (kind, config.policy(kind)))
                .collect(),
            min_spacing: interval_secs(config.min_spacing_secs),
            max_backoff: interval_secs(config.max_backoff_secs),
            history_window: interval_secs(config.history_window_secs),
            suppression_backoff_threshold: config.suppression_backoff_threshold.max(1),
            stale_after: interval_secs(config.stale_state_secs),
        }
    }

    fn policy(&self, kind: NotificationType) -> TypePolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| TypePolicy::builtin(kind))
    }

    fn max_multiplier(&self) -> u32 {
        let spacing = self.min_spacing.num_seconds();
        if spacing <= 0 {
            return 1;
        }
        let ratio = (self.max_backoff.num_seconds() + spacing - 1) / spacing;
        ratio.clamp(1, i64::from(u32::MAX)) as u32
    }

    fn effective_spacing(&self, multiplier: u32) -> Duration {
        let factor = i32::try_from(multiplier.max(1)).unwrap_or(i32::MAX);
        self.min_spacing
            .checked_mul(factor)
            .map_or(self.max_backoff, |scaled| scaled.min(self.max_backoff))
    }
}

#[derive(Debug, Clone, Default)]
struct TypeState {
    last_sent: Option<DateTime<Utc>>,
    hourly_count: u32,
    hour_started: Option<DateTime<Utc>>,
    daily_count: u32,
    day_started: Option<DateTime<Utc>>,
}

impl TypeState {
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if self.hour_started.is_some_and(|s| now - s >= Duration::hours(1)) {
            self.hourly_count = 0;
            self.hour_started = None;
        }
        if self.day_started.is_some_and(|s| now - s >= Duration::days(1)) {
            self.daily_count = 0;
            self.day_started = None;
        }
    }

    fn record_send(&mut self, now: DateTime<Utc>) {
        self.last_sent = Some(now);
        self.hour_started.get_or_insert(now);
        self.day_started.get_or_insert(now);
        self.hourly_count += 1;
        self.daily_count += 1;
    }
}

#[derive(Debug, Clone)]
struct UserState {
    types: HashMap<NotificationType, TypeState>,
    last_any_sent: Option<DateTime<Utc>>,
    backoff_multiplier: u32,
    recent: VecDeque<DateTime<Utc>>,
    spacing_denials: u32,
    last_activity: DateTime<Utc>,
}

impl UserState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            types: HashMap::new(),
            last_any_sent: None,
            backoff_multiplier: 1,
            recent: VecDeque::new(),
            spacing_denials: 0,
            last_activity: now,
        }
    }

    /// Expire history and counters that fell out of their windows
    fn prepare(&mut self, now: DateTime<Utc>, history_window: Duration) {
        while self.recent.front().is_some_and(|&t| now - t >= history_window) {
            self.recent.pop_front();
        }
        if self.recent.is_empty() {
            self.backoff_multiplier = 1;
            self.spacing_denials = 0;
        }
        for state in self.types.values_mut() {
            state.roll_windows(now);
        }
    }

    fn record_send(&mut self, kind: NotificationType, now: DateTime<Utc>) {
        self.types.entry(kind).or_default().record_send(now);
        self.last_any_sent = Some(now);
        self.spacing_denials = 0;
        self.recent.push_back(now);
        while self.recent.len() > RECENT_HISTORY_CAP {
            self.recent.pop_front();
        }
    }
}

// ============================================================================
// Limiter
// ============================================================================

/// Decides whether a notification may be sent now
pub struct NotificationLimiter {
    settings: LimiterSettings,
    users: RwLock<HashMap<String, UserState>>,
    denials: Mutex<DenialAudit>,
    denial_log: Option<Arc<dyn DenialLog>>,
}

#[derive(Default)]
struct DenialAudit {
    recent: VecDeque<DenialRecord>,
    counts: HashMap<(NotificationType, DenialReason), u64>,
}

impl NotificationLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            settings,
            users: RwLock::new(HashMap::new()),
            denials: Mutex::new(DenialAudit::default()),
            denial_log: None,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(LimiterSettings::from_config(config))
    }

    /// Persist every denial through `log`
    pub fn with_denial_log(mut self, log: Arc<dyn DenialLog>) -> Self {
        self.denial_log = Some(log);
        self
    }

    /// Admit and record the send if allowed
    pub async fn can_send(&self, user_key: &str, kind: NotificationType, self_funded: bool) -> bool {
        self.admit_at(user_key, kind, self_funded, Utc::now())
            .await
            .is_allowed()
    }

    /// Atomic check-and-record. An allowed verdict counts as a send.
    pub async fn admit_at(
        &self,
        user_key: &str,
        kind: NotificationType,
        self_funded: bool,
        now: DateTime<Utc>,
    ) -> Admission {
        let admission = {
            let mut users = self.users.write().await;
            let state = users
                .entry(user_key.to_string())
                .or_insert_with(|| UserState::new(now));
            state.last_activity = now;
            state.prepare(now, self.settings.history_window);

            let admission = self.evaluate(state, kind, self_funded, now);
            match admission {
                Admission::Allowed => state.record_send(kind, now),
                Admission::Denied(DenialReason::MinSpacing) => {
                    state.spacing_denials += 1;
                    if state.spacing_denials >= self.settings.suppression_backoff_threshold {
                        state.spacing_denials = 0;
                        self.raise_backoff(user_key, state);
                    }
                }
                Admission::Denied(_) => {}
            }
            admission
        };

        if let Admission::Denied(reason) = admission {
            self.record_denial(user_key, kind, reason, now);
        }
        admission
    }

    /// Verdict without recording anything
    pub async fn check_at(
        &self,
        user_key: &str,
        kind: NotificationType,
        self_funded: bool,
        now: DateTime<Utc>,
    ) -> Admission {
        let users = self.users.read().await;
        match users.get(user_key) {
            Some(state) => {
                let mut view = state.clone();
                view.prepare(now, self.settings.history_window);
                self.evaluate(&view, kind, self_funded, now)
            }
            None => Admission::Allowed,
        }
    }

    /// A delivery to this user failed; lengthen their spacing
    pub async fn record_delivery_failure(&self, user_key: &str) {
        self.record_delivery_failure_at(user_key, Utc::now()).await;
    }

    pub async fn record_delivery_failure_at(&self, user_key: &str, now: DateTime<Utc>) {
        let mut users = self.users.write().await;
        let state = users
            .entry(user_key.to_string())
            .or_insert_with(|| UserState::new(now));
        state.last_activity = now;
        self.raise_backoff(user_key, state);
    }

    /// Drop state for users idle longer than the stale threshold
    pub async fn cleanup_stale_at(&self, now: DateTime<Utc>) -> usize {
        let mut users = self.users.write().await;
        let before = users.len();
        users.retain(|_, state| now - state.last_activity < self.settings.stale_after);
        let removed = before - users.len();
        if removed > 0 {
            info!(removed = removed, remaining = users.len(), "Dropped stale notification state");
        }
        removed
    }

    /// Run `cleanup_stale_at` periodically until shutdown
    pub fn start_cleanup_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.cleanup_stale_at(Utc::now()).await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Notification cleanup loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub async fn backoff_multiplier(&self, user_key: &str) -> u32 {
        self.users
            .read()
            .await
            .get(user_key)
            .map_or(1, |s| s.backoff_multiplier)
    }

    /// Spacing currently enforced for a user
    pub async fn effective_spacing(&self, user_key: &str) -> Duration {
        let multiplier = self.backoff_multiplier(user_key).await;
        self.settings.effective_spacing(multiplier)
    }

    /// Sends of `kind` in the user's current rolling hour
    pub async fn hourly_count_at(&self, user_key: &str, kind: NotificationType, now: DateTime<Utc>) -> u32 {
        let users = self.users.read().await;
        let Some(state) = users.get(user_key).and_then(|u| u.types.get(&kind)) else {
            return 0;
        };
        let mut view = state.clone();
        view.roll_windows(now);
        view.hourly_count
    }

    pub async fn tracked_users(&self) -> usize {
        self.users.read().await.len()
    }

    /// Most recent denials, oldest first
    pub fn recent_denials(&self) -> Vec<DenialRecord> {
        self.with_audit(|audit| audit.recent.iter().cloned().collect())
    }

    pub fn denial_count(&self, kind: NotificationType, reason: DenialReason) -> u64 {
        self.with_audit(|audit| audit.counts.get(&(kind, reason)).copied().unwrap_or(0))
    }

    fn evaluate(
        &self,
        state: &UserState,
        kind: NotificationType,
        self_funded: bool,
        now: DateTime<Utc>,
    ) -> Admission {
        let policy = self.settings.policy(kind);
        if policy.critical {
            return Admission::Allowed;
        }

        let type_state = state.types.get(&kind);

        if let Some(last) = type_state.and_then(|t| t.last_sent) {
            if now - last < interval_secs(policy.cooldown_secs) {
                return Admission::Denied(DenialReason::Cooldown);
            }
        }

        if let Some(last) = state.last_any_sent {
            if now - last < self.settings.effective_spacing(state.backoff_multiplier) {
                return Admission::Denied(DenialReason::MinSpacing);
            }
        }

        if !self_funded {
            if let Some(t) = type_state {
                if t.hourly_count >= policy.hourly_cap {
                    return Admission::Denied(DenialReason::HourlyCap);
                }
                if policy.daily_cap.is_some_and(|cap| t.daily_count >= cap) {
                    return Admission::Denied(DenialReason::DailyCap);
                }
            }
        }

        Admission::Allowed
    }

    fn raise_backoff(&self, user_key: &str, state: &mut UserState) {
        let next = state
            .backoff_multiplier
            .saturating_mul(2)
            .min(self.settings.max_multiplier());
        if next != state.backoff_multiplier {
            state.backoff_multiplier = next;
            info!(
                user_key = user_key,
                multiplier = next,
                spacing_secs = self.settings.effective_spacing(next).num_seconds(),
                "Notification backoff raised"
            );
        }
    }

    fn record_denial(&self, user_key: &str, kind: NotificationType, reason: DenialReason, now: DateTime<Utc>) {
        let record = DenialRecord {
            user_key: user_key.to_string(),
            kind,
            reason,
            at: now,
        };

        self.with_audit(|audit| {
            *audit.counts.entry((kind, reason)).or_insert(0) += 1;
            audit.recent.push_back(record.clone());
            while audit.recent.len() > DENIAL_RING_CAP {
                audit.recent.pop_front();
            }
        });
        metrics::record_notification_denied(kind.as_str(), reason.as_str());
        debug!(user_key = user_key, kind = %kind, reason = %reason, "Notification denied");

        let Some(log) = self.denial_log.as_ref().map(Arc::clone) else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                if let Err(e) = log.record(&record) {
                    warn!(error = %e, "Failed to persist notification denial");
                }
            });
        }
    }

    fn with_audit<T>(&self, f: impl FnOnce(&mut DenialAudit) -> T) -> T {
        match self.denials.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
