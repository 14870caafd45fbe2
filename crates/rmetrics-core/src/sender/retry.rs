//! Bounded retries with arithmetically growing delays.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How many times to try and how long to wait in between.
///
/// The wait after attempt `n` is `base_delay + step * (n - 1)`, so delays
/// grow strictly while `step` is non-zero. Nothing is awaited after the
/// last attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay + self.step * attempt.saturating_sub(1)
    }
}

/// All attempts failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Runs `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy runs out of attempts.
///
/// `op` receives the 1-based attempt number. A non-retryable error ends the
/// loop at once and is returned as `last`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(last) if attempt >= max_attempts || !retryable(&last) => {
                return Err(Exhausted {
                    attempts: attempt,
                    last,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
