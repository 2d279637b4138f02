//! Retry/backoff combinator shared by the fetch and write paths.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to every backoff.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt_index, max_delay)`, where index 0 is the delay
    /// after the first failed attempt.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay.saturating_add(Duration::from_millis(jitter))
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: usize,
    /// Every error the classifier marked retryable, including a final one
    /// that exhausted the budget.
    pub transient_errors: usize,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retry budget is spent. `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, Op, Fut, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: Op,
) -> RetryOutcome<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: Display,
{
    let mut attempt = 0usize;
    let mut transient_errors = 0usize;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    transient_errors,
                }
            }
            Err(err) => {
                let disposition = classify(&err);
                if disposition == RetryDisposition::Retryable {
                    transient_errors += 1;
                }
                if disposition == RetryDisposition::NonRetryable || attempt >= policy.max_retries {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        transient_errors,
                    };
                }

                let delay = policy.jittered_delay(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
