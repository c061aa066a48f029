//! Bounded local retries
//!
//! A status request that fails transiently is retried a few times inside the
//! same check before the failure counts against the account. The loop never
//! runs more than `max_retries + 1` attempts.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Extra attempts after the first
    pub max_retries: u32,

    /// Delay before the first retry; doubles each retry
    pub base_delay: Duration,

    /// Ceiling for a single delay
    pub max_delay: Duration,

    /// Spread each delay uniformly over `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(base_delay_ms)),
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Upper bound of the pause before retry number `retry` (1-based)
    pub fn ceiling_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling_for(retry);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=ceiling - half)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the retry budget is spent. The last error is returned.
///
/// ```no_run
/// use banwatch::utils::retry::{with_retry_if, RetryConfig};
///
/// # async fn example() -> Result<(), std::io::Error> {
/// let config = RetryConfig::with_delays(2, 100, 1000);
/// let value = with_retry_if(
///     &config,
///     move || async move { Ok::<_, std::io::Error>(42) },
///     |e| e.kind() == std::io::ErrorKind::TimedOut,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_retry_if<T, E, F, Fut, P>(config: &RetryConfig, operation: F, should_retry: P) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(retries = retry, "Recovered after local retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !should_retry(&error) {
            return Err(error);
        }
        if retry >= config.max_retries {
            warn!(attempts = retry + 1, error = %error, "Local retries exhausted");
            return Err(error);
        }

        retry += 1;
        let delay = config.delay_for(retry);
        debug!(
            retry = retry,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::with_delays(max_retries, 1, 5)
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retry_if(
            &fast(3),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), String> = with_retry_if(
            &fast(2),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("502".to_string())
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "502");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), String> = with_retry_if(
            &fast(3),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("403 forbidden".to_string())
            },
            |e| !e.starts_with("403"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let config = RetryConfig::with_delays(10, 500, 3_000);

        assert_eq!(config.ceiling_for(0), Duration::ZERO);
        assert_eq!(config.ceiling_for(1), Duration::from_millis(500));
        assert_eq!(config.ceiling_for(2), Duration::from_millis(1_000));
        assert_eq!(config.ceiling_for(3), Duration::from_millis(2_000));
        assert_eq!(config.ceiling_for(4), Duration::from_millis(3_000));
        assert_eq!(config.ceiling_for(40), Duration::from_millis(3_000));
    }

    #[test]
    fn test_jitter_stays_within_upper_half() {
        let config = RetryConfig::with_delays(5, 400, 400).with_jitter();
        for _ in 0..50 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
    }
}
