//! Bounded retry with jittered exponential backoff

use std::future::Future;
use std::time::Duration;

use avatar_config::RetryConfig;
use avatar_core::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Backoff::new(
                Duration::from_millis(config.base_delay_ms),
                Duration::from_millis(config.max_delay_ms),
                Duration::from_millis(config.jitter_ms),
            ),
        )
    }
}

/// Run `op` until it succeeds, the attempts run out, or `should_retry`
/// declines
///
/// `op` receives the 1-based attempt number. `on_retry(error, attempt, delay)`
/// runs before each sleep. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut, S, R>(
    policy: &RetryPolicy,
    mut op: F,
    should_retry: S,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Fn(&E) -> bool,
    R: FnMut(&E, u32, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts || !should_retry(&e) => return Err(e),
            Err(e) => {
                let delay = policy.backoff.delay(attempt);
                on_retry(&e, attempt, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
