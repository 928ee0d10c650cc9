//! Exponential backoff with jitter
//!
//! One policy object replaces the ad hoc retry loops: it knows how many
//! attempts to make, how long to wait between them, and asks a classifier
//! whether a given error is worth another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to one `base_delay` of random jitter to every wait
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Wait before retry number `attempt`; the wait after the first failure is `attempt = 0`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let mut delay = self.base_delay.saturating_mul(factor);
        if self.jitter && !self.base_delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..1.0);
            delay += self.base_delay.mul_f64(extra);
        }
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(label, op, SyncError::is_retryable).await
    }

    /// Like [`RetryPolicy::run`] with a custom retryable-vs-fatal classifier.
    pub async fn run_if<T, F, Fut, C>(&self, label: &str, mut op: F, retryable: C) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&SyncError) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        log::error!("{}: giving up after {} attempt(s): {}", label, attempt + 1, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_one_base_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result = policy
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Timeout)
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<()> = policy
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Timeout)
            })
            .await;
        assert!(matches!(result, Err(SyncError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<()> = policy
            .run("auth", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Auth(AuthError::InvalidGrant("revoked".into())))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
