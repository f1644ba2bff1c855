//! Bounded retry for transient command failures.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Retry budget for a command.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub deadline: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            deadline: Duration::from_secs(30),
            backoff: Duration::from_millis(100),
        }
    }
}

/// Run an operation, retrying while it fails with a retryable error
/// (a timeout, or a topology the receiver considered outdated).
///
/// The last error is returned once the attempt or time budget runs out.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + policy.deadline;
    let mut backoff = policy.backoff;
    let mut last_err = Error::Timeout;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                debug!(attempt, %err, "retryable failure");
                last_err = err;
            }
            Err(err) => return Err(err),
        }
        if attempt == policy.max_attempts || Instant::now() + backoff > deadline {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    Err(last_err)
}
