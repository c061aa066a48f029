//! Due-check policy

use chrono::{DateTime, Duration, Utc};

use super::account::{BanStatus, MonitoredAccount, UserSettings};
use crate::config::{interval_secs, CheckerConfig};

/// Decides whether an account needs a check now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuePolicy {
    pub default_interval: Duration,
    pub banned_recheck_interval: Duration,
    pub error_cooldown: Duration,
}

impl Default for DuePolicy {
    fn default() -> Self {
        Self::from_config(&CheckerConfig::default())
    }
}

impl DuePolicy {
    pub fn from_config(config: &CheckerConfig) -> Self {
        Self {
            default_interval: interval_secs(config.default_interval_secs),
            banned_recheck_interval: interval_secs(config.banned_recheck_interval_secs),
            error_cooldown: interval_secs(config.error_cooldown_secs),
        }
    }

    /// Interval between checks for this account
    pub fn interval_for(&self, account: &MonitoredAccount, settings: &UserSettings) -> Duration {
        if account.status == BanStatus::Permanent {
            return self.banned_recheck_interval;
        }
        settings
            .check_interval_secs
            .filter(|&secs| secs > 0)
            .map(interval_secs)
            .unwrap_or(self.default_interval)
    }

    pub fn should_check(&self, account: &MonitoredAccount, settings: &UserSettings, now: DateTime<Utc>) -> bool {
        if account.check_disabled || account.cookie_expired {
            return false;
        }

        if account.consecutive_errors > 0 {
            if let Some(last_error) = account.last_error {
                if now - last_error < self.error_cooldown {
                    return false;
                }
            }
        }

        match account.last_check {
            None => true,
            Some(last) => now - last >= self.interval_for(account, settings),
        }
    }
}
