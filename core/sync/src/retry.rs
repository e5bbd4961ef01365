//! Exponential backoff for transient remote failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use catalogsync_common::{Error, Result};

/// How often and how patiently a failed batch dispatch is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay over 75%..125% of its nominal value.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Never retry.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let nominal = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(retry as i32);
        let capped = nominal.min(self.max_delay.as_millis() as f64);
        let millis = if self.jitter {
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs an operation, retrying it while it fails transiently.
///
/// Only errors for which [`Error::is_transient`] holds are retried: a
/// payload the destination rejected will be rejected again.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. The last error is returned on exhaustion.
    pub async fn execute<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(label, operation, Error::is_transient)
            .await
    }

    /// Like [`execute`](Self::execute) with a caller-supplied retry predicate.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        label: &str,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("{} succeeded after {} retries", label, retries);
                    }
                    return Ok(value);
                }
                Err(err) if !should_retry(&err) => return Err(err),
                Err(err) if retries >= self.config.max_retries => {
                    warn!("{} failed after {} attempts: {}", label, retries + 1, err);
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.config.delay_for_retry(retries);
                    retries += 1;
                    warn!(
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        label, retries, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter(false);

        assert_eq!(config.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_retry(3), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(1).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = config.delay_for_retry(0).as_millis();
            assert!((750..=1250).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = fast(3)
            .execute("batch", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Http {
                            status: 503,
                            body: "busy".to_string(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = fast(3)
            .execute("batch", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Http {
                        status: 400,
                        body: "invalid sku".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Http { status: 400, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = fast(2)
            .execute("batch", move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network(format!("reset {}", n)))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "Network error: reset 2");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_retry_runs_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let executor = RetryExecutor::new(RetryConfig::disabled());

        let result: Result<u32> = executor
            .execute("batch", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network("down".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
