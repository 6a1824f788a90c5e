use std::{future::Future, time::Duration};

use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Runs `operation` until it succeeds, fails with anything but a conflict,
/// or the attempt budget is spent. The closure receives the 0-based attempt
/// number so later attempts know to re-read before writing.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match operation(attempt).await {
            Err(error) if error.is_conflict() && attempt + 1 < max_attempts => {
                debug!(what, attempt, "conflict on write, retrying with a fresh read");
                attempt += 1;
            }
            Err(error) => {
                if error.is_conflict() {
                    warn!(what, attempts = max_attempts, "conflict retry budget exhausted");
                }
                return Err(error);
            }
            Ok(value) => return Ok(value),
        }
    }
}
