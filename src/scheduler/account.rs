//! Account records consumed by the checker and the store seam
//!
//! Account and user rows belong to the surrounding application. The checker
//! reads them through [`AccountStore`], evaluates them and writes them back.
//! [`InMemoryAccountStore`] keeps everything in memory and can round-trip a
//! JSON file so the worker runs standalone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::{CheckError, CheckResult};
use crate::captcha::SolverPreference;

// ============================================================================
// Ban Status
// ============================================================================

/// Standing reported by the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanStatus {
    GoodStanding,
    Permanent,
    UnderReview,
    Temporary,
    #[default]
    Unknown,
    /// Session credential rejected by the endpoint
    InvalidCredential,
}

impl BanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoodStanding => "good_standing",
            Self::Permanent => "permanent",
            Self::UnderReview => "under_review",
            Self::Temporary => "temporary",
            Self::Unknown => "unknown",
            Self::InvalidCredential => "invalid_credential",
        }
    }

    /// Classify the endpoint's status string. Unrecognized values are `Unknown`.
    pub fn from_response(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "good_standing" | "ok" | "active" | "clean" => Self::GoodStanding,
            "permanent" | "banned" | "permanently_banned" => Self::Permanent,
            "under_review" | "pending" | "in_review" => Self::UnderReview,
            "temporary" | "suspended" | "temporarily_banned" => Self::Temporary,
            "invalid_credential" | "unauthorized" => Self::InvalidCredential,
            _ => Self::Unknown,
        }
    }

    /// Human-readable label for notifications
    pub fn describe(&self) -> &'static str {
        match self {
            Self::GoodStanding => "in good standing",
            Self::Permanent => "permanently banned",
            Self::UnderReview => "under review",
            Self::Temporary => "temporarily banned",
            Self::Unknown => "in an unknown state",
            Self::InvalidCredential => "unreachable (session expired)",
        }
    }
}

impl fmt::Display for BanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// One monitored account
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredAccount {
    pub id: String,
    pub user_key: String,

    /// Identifier sent to the status endpoint
    pub external_id: String,

    /// Session cookie for the status endpoint
    #[serde(default)]
    pub session: Option<String>,

    #[serde(default)]
    pub status: BanStatus,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error_message: Option<String>,

    #[serde(default)]
    pub check_disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,

    /// Set on a 401; cleared by whoever refreshes the session
    #[serde(default)]
    pub cookie_expired: bool,
}

impl MonitoredAccount {
    pub fn new(id: impl Into<String>, user_key: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_key: user_key.into(),
            external_id: external_id.into(),
            session: None,
            status: BanStatus::Unknown,
            status_changed_at: None,
            consecutive_errors: 0,
            last_check: None,
            last_success: None,
            last_error: None,
            last_error_message: None,
            check_disabled: false,
            disabled_reason: None,
            cookie_expired: false,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

impl fmt::Debug for MonitoredAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredAccount")
            .field("id", &self.id)
            .field("user_key", &self.user_key)
            .field("external_id", &self.external_id)
            .field("session", &self.session.as_ref().map(|_| "***"))
            .field("status", &self.status)
            .field("consecutive_errors", &self.consecutive_errors)
            .field("last_check", &self.last_check)
            .field("check_disabled", &self.check_disabled)
            .field("cookie_expired", &self.cookie_expired)
            .finish()
    }
}

/// Per-user preferences relevant to checking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_key: String,

    /// Overrides the default check interval
    #[serde(default)]
    pub check_interval_secs: Option<u64>,

    #[serde(default)]
    pub solver: SolverPreference,
}

impl UserSettings {
    pub fn new(user_key: impl Into<String>) -> Self {
        Self {
            user_key: user_key.into(),
            ..Self::default()
        }
    }
}

/// A recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub account_id: String,
    pub user_key: String,
    pub from: BanStatus,
    pub to: BanStatus,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Store
// ============================================================================

/// Access to account and user records
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_accounts(&self) -> CheckResult<Vec<MonitoredAccount>>;

    async fn get_account(&self, account_id: &str) -> CheckResult<Option<MonitoredAccount>>;

    async fn update_account(&self, account: &MonitoredAccount) -> CheckResult<()>;

    /// Settings for a user; defaults when none are stored
    async fn user_settings(&self, user_key: &str) -> CheckResult<UserSettings>;

    async fn record_transition(&self, transition: &StatusTransition) -> CheckResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountSnapshot {
    #[serde(default)]
    accounts: Vec<MonitoredAccount>,
    #[serde(default)]
    users: Vec<UserSettings>,
    #[serde(default)]
    transitions: Vec<StatusTransition>,
}

#[derive(Default)]
struct StoreState {
    accounts: BTreeMap<String, MonitoredAccount>,
    users: HashMap<String, UserSettings>,
    transitions: Vec<StatusTransition>,
}

/// In-memory store with optional JSON persistence
#[derive(Clone, Default)]
pub struct InMemoryAccountStore {
    state: Arc<RwLock<StoreState>>,
    path: Option<PathBuf>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file yields an empty store bound to it
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref().to_path_buf();
        let snapshot: AccountSnapshot = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse accounts file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AccountSnapshot::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read accounts file {}", path.display()))
            }
        };

        let state = StoreState {
            accounts: snapshot
                .accounts
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            users: snapshot
                .users
                .into_iter()
                .map(|u| (u.user_key.clone(), u))
                .collect(),
            transitions: snapshot.transitions,
        };

        tracing::info!(
            path = %path.display(),
            accounts = state.accounts.len(),
            users = state.users.len(),
            "Loaded account store"
        );

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        })
    }

    /// Write the current state back to the bound file, if any
    pub async fn save(&self) -> CheckResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let state = self.state.read().await;
            let snapshot = AccountSnapshot {
                accounts: state.accounts.values().cloned().collect(),
                users: state.users.values().cloned().collect(),
                transitions: state.transitions.clone(),
            };
            serde_json::to_string_pretty(&snapshot)?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn insert_account(&self, account: MonitoredAccount) {
        self.state
            .write()
            .await
            .accounts
            .insert(account.id.clone(), account);
    }

    pub async fn insert_user(&self, settings: UserSettings) {
        self.state
            .write()
            .await
            .users
            .insert(settings.user_key.clone(), settings);
    }

    pub async fn transitions(&self) -> Vec<StatusTransition> {
        self.state.read().await.transitions.clone()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn list_accounts(&self) -> CheckResult<Vec<MonitoredAccount>> {
        Ok(self.state.read().await.accounts.values().cloned().collect())
    }

    async fn get_account(&self, account_id: &str) -> CheckResult<Option<MonitoredAccount>> {
        Ok(self.state.read().await.accounts.get(account_id).cloned())
    }

    async fn update_account(&self, account: &MonitoredAccount) -> CheckResult<()> {
        let mut state = self.state.write().await;
        match state.accounts.get_mut(&account.id) {
            Some(existing) => {
                *existing = account.clone();
                Ok(())
            }
            None => Err(CheckError::Store(format!("unknown account {}", account.id))),
        }
    }

    async fn user_settings(&self, user_key: &str) -> CheckResult<UserSettings> {
        Ok(self
            .state
            .read()
            .await
            .users
            .get(user_key)
            .cloned()
            .unwrap_or_else(|| UserSettings::new(user_key)))
    }

    async fn record_transition(&self, transition: &StatusTransition) -> CheckResult<()> {
        self.state.write().await.transitions.push(transition.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_classification() {
        assert_eq!(BanStatus::from_response("Good Standing"), BanStatus::GoodStanding);
        assert_eq!(BanStatus::from_response("permanently-banned"), BanStatus::Permanent);
        assert_eq!(BanStatus::from_response("UNDER_REVIEW"), BanStatus::UnderReview);
        assert_eq!(BanStatus::from_response("suspended"), BanStatus::Temporary);
        assert_eq!(BanStatus::from_response("???"), BanStatus::Unknown);
    }

    #[test]
    fn test_debug_hides_session() {
        let account = MonitoredAccount::new("a1", "u1", "ext-1").with_session("secret-cookie");
        let debug = format!("{account:?}");
        assert!(!debug.contains("secret-cookie"));
    }

    #[tokio::test]
    async fn test_update_unknown_account_fails() {
        let store = InMemoryAccountStore::new();
        let account = MonitoredAccount::new("missing", "u", "x");
        assert!(matches!(
            store.update_account(&account).await,
            Err(CheckError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_default_user_settings() {
        let store = InMemoryAccountStore::new();
        let settings = store.user_settings("nobody").await.unwrap();
        assert_eq!(settings.user_key, "nobody");
        assert!(!settings.solver.is_self_funded());
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");

        let store = InMemoryAccountStore::load(&path).await.unwrap();
        let mut account = MonitoredAccount::new("a1", "u1", "ext-1");
        account.status = BanStatus::Permanent;
        store.insert_account(account).await;
        store.insert_user(UserSettings::new("u1")).await;
        store.save().await.unwrap();

        let reloaded = InMemoryAccountStore::load(&path).await.unwrap();
        let account = reloaded.get_account("a1").await.unwrap().unwrap();
        assert_eq!(account.status, BanStatus::Permanent);
    }
}
