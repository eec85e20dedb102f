use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ServiceError;

/// Bounded retry for calls that leave the process.
///
/// Each attempt is capped by `call_timeout`; an elapsed attempt counts as a
/// transient failure. Only transient failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            call_timeout: Duration::from_secs(config.call_timeout_secs.max(1)),
        }
    }

    /// Single attempt, no backoff. Used where a retry would be wrong or slow
    /// (best-effort notifications, tests).
    pub fn single_attempt(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            call_timeout,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 1;
        let mut delay = self.initial_backoff;

        loop {
            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Transient(format!(
                    "{} timed out after {:?}",
                    label, self.call_timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.max_attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    delay = (delay * 2).min(self.max_backoff);
                }
                Err(error) => {
                    if error.is_transient() {
                        tracing::warn!(
                            "{} giving up after {} attempt(s): {}",
                            label,
                            attempt,
                            error
                        );
                    }
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = quick_policy(3)
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::Transient("503".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_capped() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(2)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Transient("503".to_string()))
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(5)
            .run("revoked", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Auth("invalid_grant".to_string()))
            })
            .await;

        assert!(result.unwrap_err().is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..quick_policy(1)
        };
        let result: Result<(), _> = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_transient());
    }
}
