//! Retry and backoff utilities for container-start and network operations
//!
//! Two profiles matter in practice: container start (few attempts, fixed
//! backoff) and network-sensitive package installs (exponential backoff with
//! jitter). Both run through [`retry_async`] with an error classifier that
//! decides whether a failure is worth another attempt.

use std::time::Duration;
use tracing::{debug, warn};

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// No jitter: use the calculated delay as-is
    #[default]
    None,
    /// Full jitter: random delay between 0 and calculated delay
    FullJitter,
}

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay between every attempt
    Fixed,
    /// `base_delay * 2^attempt`, capped at `max_delay`
    Exponential,
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding the initial attempt)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub backoff: BackoffStrategy,
    /// Jitter strategy
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::FullJitter,
        }
    }
}

impl RetryConfig {
    /// Container start profile: 2 retries after the initial attempt, 5 s apart.
    pub fn container_start() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            backoff: BackoffStrategy::Fixed,
            jitter: JitterStrategy::None,
        }
    }

    /// Network-sensitive install profile (package repositories, downloads).
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::FullJitter,
        }
    }

    /// Calculate the delay for a given attempt number (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let raw_ms = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay.as_millis(),
            BackoffStrategy::Exponential => self
                .base_delay
                .as_millis()
                .saturating_mul(2_u128.saturating_pow(attempt)),
        };
        let capped_ms = raw_ms.min(self.max_delay.as_millis()) as u64;
        self.apply_jitter(Duration::from_millis(capped_ms))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::FullJitter => {
                let jitter_ms = fastrand::u64(0..=delay.as_millis() as u64);
                Duration::from_millis(jitter_ms)
            }
        }
    }
}

/// Error classification result for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Do not retry (terminal error)
    Stop,
}

/// Error classifier function type
pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Default error classifier that retries on all errors
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retry an async operation according to `config`.
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: Fn(u32) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 0..=config.max_attempts {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                debug!(attempt, %error, "operation failed");
                if classify_error(&error) == RetryDecision::Stop {
                    return Err(error);
                }
                last_error = Some(error);
                if attempt < config.max_attempts {
                    let delay = config.calculate_delay(attempt);
                    debug!(?delay, "sleeping before next attempt");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let final_error = last_error.expect("at least one attempt must have run");
    warn!(
        attempts = config.max_attempts + 1,
        %final_error,
        "all retry attempts exhausted"
    );
    Err(final_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fixed_backoff_is_constant() {
        let config = RetryConfig::container_start();
        assert_eq!(config.calculate_delay(0), Duration::from_secs(5));
        assert_eq!(config.calculate_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        };
        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(500));
        assert_eq!(config.calculate_delay(10), Duration::from_millis(500));
    }

    #[test]
    fn full_jitter_stays_within_bounds() {
        let config = RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::FullJitter,
        };
        for _ in 0..32 {
            assert!(config.calculate_delay(0) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: BackoffStrategy::Fixed,
            jitter: JitterStrategy::None,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_async(
            &config,
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            default_classifier,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stop_classifier_short_circuits() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: BackoffStrategy::Fixed,
            jitter: JitterStrategy::None,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let classifier = |error: &&str| {
            if *error == "terminal" {
                RetryDecision::Stop
            } else {
                RetryDecision::Retry
            }
        };

        let result: std::result::Result<(), &str> = retry_async(
            &config,
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("terminal")
                }
            },
            classifier,
        )
        .await;

        assert_eq!(result.unwrap_err(), "terminal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: BackoffStrategy::Fixed,
            jitter: JitterStrategy::None,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: std::result::Result<(), &str> = retry_async(
            &config,
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("still failing")
                }
            },
            default_classifier,
        )
        .await;

        assert_eq!(result.unwrap_err(), "still failing");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
