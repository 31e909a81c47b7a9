//! Retry utilities with exponential backoff
//!
//! Used for store writes that lose an optimistic-concurrency race. Delays grow
//! exponentially and carry jitter so that competing writers spread out.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt)
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Add up to one extra delay's worth of random jitter
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.use_jitter && capped_ms > 0.0 {
            capped_ms + rand::thread_rng().gen_range(0.0..capped_ms)
        } else {
            capped_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// Final success or last error
    pub result: Result<T, E>,

    /// Attempts made, including the first
    pub attempts: u32,

    /// Time spent sleeping between attempts
    pub total_delay: Duration,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: &RetryConfig,
    is_retryable: R,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempts = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        attempts += 1;

        let err = match operation().await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts,
                    total_delay,
                }
            }
            Err(err) => err,
        };

        if attempts > config.max_retries || !is_retryable(&err) {
            return RetryResult {
                result: Err(err),
                attempts,
                total_delay,
            };
        }

        let delay = config.calculate_delay(attempts - 1);
        total_delay += delay;

        tracing::debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying after retryable failure"
        );

        sleep(delay).await;
    }
}

/// Retry configuration presets
pub mod presets {
    use super::*;

    /// Re-attempts for a store write that lost an optimistic-concurrency race
    pub fn store_conflict(max_retries: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(300));
        assert_eq!(config.calculate_delay(8), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_one_delay() {
        let config = RetryConfig::new().with_initial_delay(Duration::from_millis(100));
        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_conflict_retried_until_write_lands() {
        let calls = AtomicU32::new(0);

        let outcome = retry_with_backoff(&fast().with_max_retries(3), StorageError::is_conflict, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StorageError::Conflict("keys".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let outcome = retry_with_backoff(&fast().with_max_retries(2), StorageError::is_conflict, || async {
            Err::<(), _>(StorageError::Conflict("keys".into()))
        })
        .await;

        assert!(outcome.result.unwrap_err().is_conflict());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_conflict_not_retried() {
        let calls = AtomicU32::new(0);

        let outcome = retry_with_backoff(&fast().with_max_retries(5), StorageError::is_conflict, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(StorageError::Rejected {
                    status: 401,
                    message: "Bad credentials".into(),
                })
            }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_presets() {
        assert_eq!(presets::store_conflict(4).max_retries, 4);
    }
}
