//! Captcha task orchestration
//!
//! Vendors sit behind the [`CaptchaSolver`] capability. Every supported
//! vendor speaks the same create/poll task protocol with different
//! endpoints and credential fields, so one [`TaskApiSolver`] covers them,
//! parameterized by [`ProviderKind`]. The [`SolverRegistry`] picks a solver
//! per user preference and checks the credential's balance before a paid
//! solve.

pub mod registry;
pub mod task_api;

pub use registry::{SelectedSolver, SolveOutcome, SolverRegistry};
pub use task_api::{PollSettings, TaskApiSolver, TaskPoll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Provider
// ============================================================================

/// Supported solver vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "anti_captcha")]
    AntiCaptcha,

    #[serde(rename = "capsolver")]
    CapSolver,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AntiCaptcha => "anti_captcha",
            Self::CapSolver => "capsolver",
        }
    }

    /// Public API root
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::AntiCaptcha => "https://api.anti-captcha.com",
            Self::CapSolver => "https://api.capsolver.com",
        }
    }

    /// Task type for an invisible reCAPTCHA v2 without vendor-side proxy
    pub fn task_type(&self) -> &'static str {
        match self {
            Self::AntiCaptcha => "RecaptchaV2TaskProxyless",
            Self::CapSolver => "ReCaptchaV2TaskProxyLess",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "anti_captcha" | "anticaptcha" => Ok(Self::AntiCaptcha),
            "capsolver" | "cap_solver" => Ok(Self::CapSolver),
            other => Err(format!("unknown captcha provider: {other}")),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's solver choice. An own API key makes the user self-funded.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverPreference {
    #[serde(default)]
    pub provider: Option<ProviderKind>,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl SolverPreference {
    pub fn is_self_funded(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl std::fmt::Debug for SolverPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverPreference")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

// ============================================================================
// Task
// ============================================================================

/// Vendor-side task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Failed,
}

/// One challenge-solve request. Lives for a single check attempt.
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub provider: ProviderKind,
    pub task_id: String,
    pub status: TaskStatus,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub polls: u32,
}

impl CaptchaTask {
    pub fn new(provider: ProviderKind, task_id: impl Into<String>) -> Self {
        Self {
            provider,
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            token: None,
            created_at: Utc::now(),
            polls: 0,
        }
    }
}

/// Result of a balance check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyValidation {
    pub valid: bool,
    pub balance: f64,
}

// ============================================================================
// Solver Capability
// ============================================================================

/// A challenge-solving vendor
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Create a task and poll it until a token is ready or attempts run out
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError>;

    /// Check the credential and report the remaining balance
    async fn validate_key(&self) -> Result<KeyValidation, CaptchaError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Captcha failures, classified for the check layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptchaError {
    /// Task creation refused for configuration reasons
    #[error("Task creation rejected: {code} ({description})")]
    CreationRejected { code: String, description: String },

    /// Vendor never reported ready within the poll budget
    #[error("Captcha not ready after {attempts} polls")]
    PollingTimeout { attempts: u32 },

    /// Vendor reported an error while solving
    #[error("Vendor error: {code} ({description})")]
    VendorError { code: String, description: String },

    /// Transport failure talking to the vendor
    #[error("Network error: {0}")]
    Network(String),

    /// Credential unknown or revoked
    #[error("Invalid solver credential: {code}")]
    InvalidCredential { code: String },

    /// Balance too low for a paid solve
    #[error("Solver balance exhausted (balance: {balance:?})")]
    InsufficientBalance { balance: Option<f64> },

    /// Vendor payload did not match the protocol
    #[error("Malformed vendor response: {0}")]
    MalformedResponse(String),

    /// No credential configured for the requested vendor
    #[error("No solver configured for {0}")]
    NoSolver(String),
}

impl CaptchaError {
    /// Map a vendor error code onto the taxonomy
    pub fn from_vendor_code(code: &str, description: &str, creating: bool) -> Self {
        match code {
            "ERROR_KEY_DOES_NOT_EXIST"
            | "ERROR_WRONG_USER_KEY"
            | "ERROR_INVALID_CLIENTKEY"
            | "ERROR_KEY_DENIED_ACCESS"
            | "ERROR_IP_NOT_ALLOWED" => Self::InvalidCredential {
                code: code.to_string(),
            },
            "ERROR_ZERO_BALANCE" | "ERROR_INSUFFICIENT_BALANCE" => {
                Self::InsufficientBalance { balance: None }
            }
            _ if creating => Self::CreationRejected {
                code: code.to_string(),
                description: description.to_string(),
            },
            _ => Self::VendorError {
                code: code.to_string(),
                description: description.to_string(),
            },
        }
    }

    /// Retrying the check later may help
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PollingTimeout { .. }
                | Self::VendorError { .. }
                | Self::Network(_)
                | Self::MalformedResponse(_)
        )
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreationRejected { .. } => "creation_rejected",
            Self::PollingTimeout { .. } => "timeout",
            Self::VendorError { .. } => "vendor_error",
            Self::Network(_) => "network",
            Self::InvalidCredential { .. } => "invalid_credential",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::MalformedResponse(_) => "malformed",
            Self::NoSolver(_) => "no_solver",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_code_classification() {
        assert!(matches!(
            CaptchaError::from_vendor_code("ERROR_KEY_DOES_NOT_EXIST", "", true),
            CaptchaError::InvalidCredential { .. }
        ));
        assert!(matches!(
            CaptchaError::from_vendor_code("ERROR_ZERO_BALANCE", "", false),
            CaptchaError::InsufficientBalance { .. }
        ));
        assert!(matches!(
            CaptchaError::from_vendor_code("ERROR_RECAPTCHA_INVALID_SITEKEY", "bad key", true),
            CaptchaError::CreationRejected { .. }
        ));
        assert!(matches!(
            CaptchaError::from_vendor_code("ERROR_CAPTCHA_UNSOLVABLE", "", false),
            CaptchaError::VendorError { .. }
        ));
    }

    #[test]
    fn test_recoverability() {
        assert!(CaptchaError::PollingTimeout { attempts: 6 }.is_recoverable());
        assert!(CaptchaError::Network("reset".into()).is_recoverable());
        assert!(!CaptchaError::InsufficientBalance { balance: Some(0.0) }.is_recoverable());
        assert!(!CaptchaError::InvalidCredential { code: "X".into() }.is_recoverable());
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("anti-captcha".parse::<ProviderKind>(), Ok(ProviderKind::AntiCaptcha));
        assert_eq!("CapSolver".parse::<ProviderKind>(), Ok(ProviderKind::CapSolver));
        assert!("2captcha".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_preference_debug_hides_key() {
        let pref = SolverPreference {
            provider: Some(ProviderKind::CapSolver),
            api_key: Some("CAP-SECRET".into()),
        };
        assert!(pref.is_self_funded());
        assert!(!format!("{pref:?}").contains("SECRET"));
    }
}
