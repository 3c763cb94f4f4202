//! Retry combinator for upstream calls

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::types::Result;

/// How many times and how long to wait between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Cap for the doubled delay; equal to `delay` for a fixed delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1500),
            max_delay: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            max_delay: delay,
        }
    }

    /// Delay before attempt `attempt + 1` (1-based `attempt`)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently or attempts run out
///
/// Only transient errors are retried. The last error is returned once the
/// attempts are exhausted.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts.max(1) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    call = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MirrorError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_err;

    #[test]
    fn test_fixed_delay_does_not_grow() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let value = retry(policy, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MirrorError::Rpc("flaky".into()))
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
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<()> = retry(policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MirrorError::Rpc("down".into()))
        })
        .await;
        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<()> = retry(policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MirrorError::Malformed("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(MirrorError::Malformed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
