//! Solver selection and pre-solve balance checks

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::task_api::TaskApiSolver;
use super::{CaptchaError, CaptchaSolver, KeyValidation, ProviderKind, SolverPreference};
use crate::config::CaptchaConfig;
use crate::utils::fingerprint;

/// Builds a solver for a user-supplied credential
pub type SolverFactory =
    Box<dyn Fn(ProviderKind, &str) -> Result<Arc<dyn CaptchaSolver>, CaptchaError> + Send + Sync>;

struct OperatorSolver {
    solver: Arc<dyn CaptchaSolver>,
    min_balance: f64,
}

#[derive(Clone, Copy)]
struct CachedBalance {
    validation: KeyValidation,
    checked_at: DateTime<Utc>,
}

/// Solver chosen for one check
#[derive(Clone)]
pub struct SelectedSolver {
    pub solver: Arc<dyn CaptchaSolver>,

    /// Paid from the user's own credential
    pub self_funded: bool,

    pub min_balance: f64,

    /// Balance-cache key (credential fingerprint, never the key itself)
    cache_key: String,
}

/// Token plus who paid for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveOutcome {
    pub token: String,
    pub provider: ProviderKind,
    pub self_funded: bool,
}

/// Per-user solver selection with a balance cache
pub struct SolverRegistry {
    default_provider: ProviderKind,
    operators: HashMap<ProviderKind, OperatorSolver>,
    factory: SolverFactory,
    user_solvers: RwLock<HashMap<String, Arc<dyn CaptchaSolver>>>,
    balances: RwLock<HashMap<String, CachedBalance>>,
    cache_ttl: chrono::Duration,
}

impl SolverRegistry {
    pub fn new(default_provider: ProviderKind, cache_ttl: std::time::Duration, factory: SolverFactory) -> Self {
        Self {
            default_provider,
            operators: HashMap::new(),
            factory,
            user_solvers: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            cache_ttl: chrono::Duration::from_std(cache_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }

    /// Operator solvers from `[[captcha.providers]]`; user keys get a
    /// [`TaskApiSolver`] with the same poll settings and base URL override.
    pub fn from_config(config: &CaptchaConfig) -> Result<Self, CaptchaError> {
        let settings = config.clone();
        let factory: SolverFactory = Box::new(move |kind, api_key| {
            let mut solver = TaskApiSolver::new(
                kind,
                api_key,
                super::PollSettings {
                    interval: settings.poll_interval(),
                    max_attempts: settings.max_poll_attempts,
                },
                std::time::Duration::from_secs(settings.request_timeout_secs),
            )?;
            if let Some(base_url) = settings.provider(kind).and_then(|p| p.base_url.as_deref()) {
                solver = solver.with_base_url(base_url);
            }
            Ok(Arc::new(solver) as Arc<dyn CaptchaSolver>)
        });

        let mut registry = Self::new(
            config.default_provider,
            std::time::Duration::from_secs(config.balance_cache_secs),
            factory,
        );
        for provider in &config.providers {
            let solver = TaskApiSolver::from_config(provider, config)?;
            registry.register_operator(Arc::new(solver), provider.min_balance);
        }
        Ok(registry)
    }

    /// Register an operator-funded solver
    pub fn register_operator(&mut self, solver: Arc<dyn CaptchaSolver>, min_balance: f64) {
        self.operators
            .insert(solver.provider(), OperatorSolver { solver, min_balance });
    }

    pub fn has_operator(&self, kind: ProviderKind) -> bool {
        self.operators.contains_key(&kind)
    }

    /// Pick the solver for a user's preference
    pub async fn select(&self, preference: &SolverPreference) -> Result<SelectedSolver, CaptchaError> {
        let kind = preference.provider.unwrap_or(self.default_provider);

        if let Some(api_key) = preference.api_key.as_deref().filter(|k| !k.is_empty()) {
            let cache_key = format!("{}:{}", kind.as_str(), fingerprint(api_key));
            let solver = self.user_solver(kind, api_key, &cache_key).await?;
            return Ok(SelectedSolver {
                solver,
                self_funded: true,
                min_balance: 0.0,
                cache_key,
            });
        }

        let operator = self
            .operators
            .get(&kind)
            .ok_or_else(|| CaptchaError::NoSolver(kind.as_str().to_string()))?;

        Ok(SelectedSolver {
            solver: Arc::clone(&operator.solver),
            self_funded: false,
            min_balance: operator.min_balance,
            cache_key: format!("operator:{}", kind.as_str()),
        })
    }

    /// Validate the credential (cached) before committing to a paid solve
    pub async fn ensure_funded(&self, selected: &SelectedSolver) -> Result<KeyValidation, CaptchaError> {
        self.ensure_funded_at(selected, Utc::now()).await
    }

    pub async fn ensure_funded_at(
        &self,
        selected: &SelectedSolver,
        now: DateTime<Utc>,
    ) -> Result<KeyValidation, CaptchaError> {
        let cached = self.balances.read().await.get(&selected.cache_key).copied();

        let validation = match cached {
            Some(entry) if now - entry.checked_at < self.cache_ttl => entry.validation,
            _ => {
                let validation = selected.solver.validate_key().await?;
                self.balances.write().await.insert(
                    selected.cache_key.clone(),
                    CachedBalance {
                        validation,
                        checked_at: now,
                    },
                );
                validation
            }
        };

        if !validation.valid {
            return Err(CaptchaError::InvalidCredential {
                code: "ERROR_KEY_DOES_NOT_EXIST".to_string(),
            });
        }
        if validation.balance <= 0.0 || validation.balance < selected.min_balance {
            warn!(
                provider = %selected.solver.provider(),
                balance = validation.balance,
                min_balance = selected.min_balance,
                self_funded = selected.self_funded,
                "Solver balance below threshold"
            );
            return Err(CaptchaError::InsufficientBalance {
                balance: Some(validation.balance),
            });
        }
        Ok(validation)
    }

    /// Select, check funds and solve
    pub async fn solve(
        &self,
        preference: &SolverPreference,
        site_key: &str,
        page_url: &str,
    ) -> Result<SolveOutcome, CaptchaError> {
        let selected = self.select(preference).await?;
        self.ensure_funded(&selected).await?;

        match selected.solver.solve(site_key, page_url).await {
            Ok(token) => Ok(SolveOutcome {
                token,
                provider: selected.solver.provider(),
                self_funded: selected.self_funded,
            }),
            Err(e) => {
                if matches!(
                    e,
                    CaptchaError::InvalidCredential { .. } | CaptchaError::InsufficientBalance { .. }
                ) {
                    self.balances.write().await.remove(&selected.cache_key);
                    debug!(provider = %selected.solver.provider(), "Balance cache invalidated");
                }
                Err(e)
            }
        }
    }

    /// Uncached balance check for an arbitrary credential
    pub async fn check_key(&self, kind: ProviderKind, api_key: &str) -> Result<KeyValidation, CaptchaError> {
        let solver = (self.factory)(kind, api_key)?;
        solver.validate_key().await
    }

    async fn user_solver(
        &self,
        kind: ProviderKind,
        api_key: &str,
        cache_key: &str,
    ) -> Result<Arc<dyn CaptchaSolver>, CaptchaError> {
        if let Some(solver) = self.user_solvers.read().await.get(cache_key) {
            return Ok(Arc::clone(solver));
        }

        let solver = (self.factory)(kind, api_key)?;
        self.user_solvers
            .write()
            .await
            .insert(cache_key.to_string(), Arc::clone(&solver));
        info!(provider = %kind, "Built solver for user credential");
        Ok(solver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSolver {
        kind: ProviderKind,
        balance: f64,
        valid: bool,
        balance_checks: AtomicU32,
    }

    impl FakeSolver {
        fn new(kind: ProviderKind, balance: f64) -> Self {
            Self {
                kind,
                balance,
                valid: true,
                balance_checks: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CaptchaSolver for FakeSolver {
        fn provider(&self) -> ProviderKind {
            self.kind
        }

        async fn solve(&self, _site_key: &str, _page_url: &str) -> Result<String, CaptchaError> {
            Ok(format!("token-{}", self.kind))
        }

        async fn validate_key(&self) -> Result<KeyValidation, CaptchaError> {
            self.balance_checks.fetch_add(1, Ordering::SeqCst);
            Ok(KeyValidation {
                valid: self.valid,
                balance: self.balance,
            })
        }
    }

    fn registry_with_factory() -> SolverRegistry {
        SolverRegistry::new(
            ProviderKind::AntiCaptcha,
            std::time::Duration::from_secs(600),
            Box::new(|kind, key| {
                let mut solver = FakeSolver::new(kind, 5.0);
                solver.valid = key != "revoked";
                Ok(Arc::new(solver) as Arc<dyn CaptchaSolver>)
            }),
        )
    }

    #[tokio::test]
    async fn test_user_key_is_self_funded() {
        let registry = registry_with_factory();
        let pref = SolverPreference {
            provider: Some(ProviderKind::CapSolver),
            api_key: Some("CAP-1".into()),
        };

        let outcome = registry.solve(&pref, "site", "https://example.com").await.unwrap();
        assert!(outcome.self_funded);
        assert_eq!(outcome.provider, ProviderKind::CapSolver);
    }

    #[tokio::test]
    async fn test_missing_operator_is_reported() {
        let registry = registry_with_factory();
        let err = registry
            .solve(&SolverPreference::default(), "site", "https://example.com")
            .await
            .unwrap_err();
        assert_eq!(err, CaptchaError::NoSolver("anti_captcha".into()));
    }

    #[tokio::test]
    async fn test_min_balance_blocks_paid_solve() {
        let mut registry = registry_with_factory();
        registry.register_operator(Arc::new(FakeSolver::new(ProviderKind::AntiCaptcha, 0.4)), 0.5);

        let err = registry
            .solve(&SolverPreference::default(), "site", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::InsufficientBalance { balance: Some(b) } if b == 0.4));
    }

    #[tokio::test]
    async fn test_revoked_user_key() {
        let registry = registry_with_factory();
        let pref = SolverPreference {
            provider: None,
            api_key: Some("revoked".into()),
        };
        let err = registry.solve(&pref, "site", "https://example.com").await.unwrap_err();
        assert!(matches!(err, CaptchaError::InvalidCredential { .. }));
    }

    #[tokio::test]
    async fn test_balance_is_cached() {
        let mut registry = registry_with_factory();
        let solver = Arc::new(FakeSolver::new(ProviderKind::AntiCaptcha, 3.0));
        registry.register_operator(solver.clone(), 1.0);

        let selected = registry.select(&SolverPreference::default()).await.unwrap();
        let now = Utc::now();
        registry.ensure_funded_at(&selected, now).await.unwrap();
        registry
            .ensure_funded_at(&selected, now + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(solver.balance_checks.load(Ordering::SeqCst), 1);

        registry
            .ensure_funded_at(&selected, now + chrono::Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(solver.balance_checks.load(Ordering::SeqCst), 2);
    }
}
