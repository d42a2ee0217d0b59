use crate::core::error::TrackerError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(1000) }
    }
}

impl RetryOptions {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay }
    }

    /// Delay slept after failed attempt `attempt` (1-indexed): `base * 2^(attempt-1)`.
    /// No jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

/// Transport failures, 5xx, 429 and 408 are retryable. 403 and 202 are left
/// to the caller.
pub fn default_retry_predicate(err: &TrackerError) -> bool {
    err.is_transient()
}

/// Runs `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or more than `max_retries` retries would be needed.
/// `on_retry(attempt, &err)` fires before each backoff sleep.
pub async fn execute_with_retry<T, E, F, Fut, P, R>(
    options: &RetryOptions,
    mut operation: F,
    should_retry: P,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    R: FnMut(u32, &E),
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt > options.max_retries || !should_retry(&e) {
                    return Err(e);
                }
                on_retry(attempt, &e);
                sleep(options.delay_for(attempt)).await;
            }
        }
    }
}
