/**
 * Retry an operation with linearly increasing backoff.
 *
 * Used in two places: optimistic-concurrency writes, which reload and reapply on a
 * `VersionConflict`, and calls to the content generator, which are retried on any
 * generation failure.
 */
use std::thread;
use std::time::Duration;

use log::{error, warn};

use super::common::{QuizError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so the operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// The sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        RetryPolicy { max_retries, backoff }
    }

    pub fn immediate(max_retries: u32) -> Self {
        RetryPolicy::new(max_retries, Duration::from_millis(0))
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects, or the
/// policy is exhausted. `op` receives the attempt number, starting at 1.
pub fn retry_with_backoff<T, F, P>(
    policy: &RetryPolicy,
    what: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
    P: Fn(&QuizError) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if attempt > policy.max_retries {
                    error!("giving up on {} after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
                warn!("{} failed on attempt {} ({}), retrying", what, attempt, e);
                let delay = policy.backoff * attempt;
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// Reload-reapply-retry loop for aggregate writes. `op` must re-read the record on
/// every call.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, what: &str, op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    retry_with_backoff(
        policy,
        what,
        |e| matches!(e, QuizError::VersionConflict(_)),
        op,
    )
}
