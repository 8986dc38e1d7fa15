//! Exponential backoff for state writes

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::StateConfig;
use crate::error::Result;

/// Bounded exponential backoff, retrying only transient errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for writes that must not be lost
    pub fn hard(config: &StateConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Single attempt; the caller logs and moves on
    pub fn best_effort() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a failure on attempt `attempt` (0-based) may be retried
    pub fn should_retry(&self, attempt: u32, transient: bool) -> bool {
        transient && attempt + 1 < self.attempts
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, e.is_transient()) => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExportError, StorageError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_up_to_ceiling() {
        let p = policy(5);
        assert_eq!(p.delay(0), Duration::from_millis(1));
        assert_eq!(p.delay(1), Duration::from_millis(2));
        assert_eq!(p.delay(2), Duration::from_millis(4));
        assert_eq!(p.delay(10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let value = policy(3)
            .run("write", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Unavailable("down".into()).into())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = policy(5)
            .run("write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExportError::NotFound("job".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result = policy(2)
            .run("write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::Unavailable("down".into()).into())
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
