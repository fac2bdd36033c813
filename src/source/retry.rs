//! Retry schedule for transient source failures

use std::future::Future;
use std::time::Duration;

/// Backoff schedule; attempt count is one more than the number of delays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![Duration::from_millis(500), Duration::from_millis(1000)])
    }
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Delay before the next attempt after attempt `attempt` (1-based)
    /// failed, or `None` when attempts are exhausted
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        attempt.checked_sub(1).and_then(|i| self.backoff.get(i)).copied()
    }
}

/// Run `op` until it succeeds, fails terminally, or the policy runs out
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_transient: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => match policy.delay_after(attempt) {
                Some(delay) => {
                    tracing::debug!(
                        "Attempt {}/{} failed: {}, retrying in {:?}",
                        attempt,
                        policy.max_attempts(),
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
