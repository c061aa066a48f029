//! Error types for account checks

use std::fmt;

use crate::captcha::CaptchaError;

/// Result type for check operations
pub type CheckResult<T> = Result<T, CheckError>;

/// Why an account was taken out of rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Integration access removed by the account owner
    AccessRevoked,
    /// Solver account has no funds left
    BalanceExhausted,
    /// Solver credential unknown or revoked
    SolverCredentialInvalid,
    /// Consecutive-error threshold reached
    RepeatedFailures,
}

impl DisableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessRevoked => "access_revoked",
            Self::BalanceExhausted => "balance_exhausted",
            Self::SolverCredentialInvalid => "solver_credential_invalid",
            Self::RepeatedFailures => "repeated_failures",
        }
    }

    /// Message shown to the account owner
    pub fn describe(&self) -> &'static str {
        match self {
            Self::AccessRevoked => "integration access was removed for this account",
            Self::BalanceExhausted => "your captcha solver balance is exhausted",
            Self::SolverCredentialInvalid => "your captcha solver API key is invalid",
            Self::RepeatedFailures => "checks failed repeatedly without a clear cause",
        }
    }
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check-level errors
#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    /// Status endpoint says our access to the account is gone
    AccessRevoked,

    /// Solver refused for lack of funds
    SolverBalanceExhausted,

    /// Solver refused the credential
    SolverCredentialInvalid,

    /// Any other captcha failure
    Captcha(CaptchaError),

    /// Transport failure to the status endpoint
    Network(String),

    /// Status endpoint throttled the route
    RateLimited { retry_after_secs: Option<u64> },

    /// Status endpoint answered with something we cannot classify
    UnexpectedResponse { status: u16, body: String },

    /// Account store failure
    Store(String),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessRevoked => write!(f, "Access to the account was revoked"),
            Self::SolverBalanceExhausted => write!(f, "Solver balance exhausted"),
            Self::SolverCredentialInvalid => write!(f, "Solver credential invalid"),
            Self::Captcha(e) => write!(f, "Captcha failed: {}", e),
            Self::Network(reason) => write!(f, "Network error: {}", reason),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited (retry after {:?}s)", retry_after_secs)
            }
            Self::UnexpectedResponse { status, body } => {
                write!(f, "Unexpected response HTTP {}: {}", status, body)
            }
            Self::Store(reason) => write!(f, "Account store error: {}", reason),
        }
    }
}

impl std::error::Error for CheckError {}

impl From<CaptchaError> for CheckError {
    fn from(err: CaptchaError) -> Self {
        match err {
            CaptchaError::InvalidCredential { .. } => Self::SolverCredentialInvalid,
            CaptchaError::InsufficientBalance { .. } => Self::SolverBalanceExhausted,
            other => Self::Captcha(other),
        }
    }
}

impl From<serde_json::Error> for CheckError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<std::io::Error> for CheckError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl CheckError {
    /// Worth retrying inside the same check
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }

    /// A later check may succeed
    pub fn is_recoverable(&self) -> bool {
        self.disable_reason().is_none()
    }

    /// Errors that disable the account regardless of the error counter
    pub fn disable_reason(&self) -> Option<DisableReason> {
        match self {
            Self::AccessRevoked => Some(DisableReason::AccessRevoked),
            Self::SolverBalanceExhausted => Some(DisableReason::BalanceExhausted),
            Self::SolverCredentialInvalid => Some(DisableReason::SolverCredentialInvalid),
            _ => None,
        }
    }

    /// Short label for metrics and admin dedup keys
    pub fn label(&self) -> &'static str {
        match self {
            Self::AccessRevoked => "access_revoked",
            Self::SolverBalanceExhausted => "balance_exhausted",
            Self::SolverCredentialInvalid => "solver_credential_invalid",
            Self::Captcha(e) => e.label(),
            Self::Network(_) => "network",
            Self::RateLimited { .. } => "rate_limited",
            Self::UnexpectedResponse { .. } => "unexpected_response",
            Self::Store(_) => "store",
        }
    }
}
