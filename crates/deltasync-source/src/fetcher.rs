//! Windowed, rate-limited request driver with per-request retry.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deltasync_core::{retry_with_backoff, BackoffPolicy};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

use crate::SourceError;

/// Requests-per-interval budget, passed to each fetcher explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests issued concurrently per window.
    pub batch_size: usize,
    /// Minimum wall-clock span of one window, including the pacing sleep.
    pub min_batch_interval: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            batch_size: 5,
            min_batch_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
    pub rate_limit: RateLimit,
    pub retry: BackoffPolicy,
    pub request_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimit::default(),
            retry: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug)]
pub struct FetchFailure<R> {
    pub request: R,
    pub error: SourceError,
    pub attempts: usize,
}

#[derive(Debug)]
pub struct FetchOutcome<R, T> {
    pub successes: Vec<(R, T)>,
    pub failures: Vec<FetchFailure<R>>,
    /// Requests never issued because the run aborted or hit its deadline.
    pub skipped: Vec<R>,
    pub windows_run: usize,
    pub deadline_hit: bool,
}

impl<R, T> FetchOutcome<R, T> {
    fn empty() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            windows_run: 0,
            deadline_hit: false,
        }
    }

    pub fn fatal_error(&self) -> Option<&SourceError> {
        self.failures
            .iter()
            .map(|f| &f.error)
            .find(|e| e.is_fatal())
    }

    pub fn all_failed(&self) -> bool {
        self.successes.is_empty() && (!self.failures.is_empty() || !self.skipped.is_empty())
    }
}

/// Clones share one rate budget: window starts are spaced across every
/// `fetch_all` call made through any clone.
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    config: FetcherConfig,
    last_window_start: Arc<Mutex<Option<Instant>>>,
}

impl BatchFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self {
            config,
            last_window_start: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Wait until a new window may start, then claim the slot.
    async fn pace_window(&self) -> Instant {
        let mut last = self.last_window_start.lock().await;
        if let Some(previous) = *last {
            let ready = previous + self.config.rate_limit.min_batch_interval;
            if Instant::now() < ready {
                tokio::time::sleep_until(ready).await;
            }
        }
        let now = Instant::now();
        *last = Some(now);
        now
    }

    /// Drive `op` over `requests` in windows of `batch_size`. A request that
    /// exhausts its retries only loses its own data; a fatal error or an expired
    /// deadline stops further windows from starting. Pacing carries over from
    /// earlier calls on this fetcher.
    pub async fn fetch_all<R, T, F, Fut>(
        &self,
        requests: Vec<R>,
        deadline: Option<Instant>,
        op: F,
    ) -> FetchOutcome<R, T>
    where
        R: Clone + Debug,
        F: Fn(R) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut outcome = FetchOutcome::empty();
        let batch_size = self.config.rate_limit.batch_size.max(1);
        let timeout = self.config.request_timeout;

        let mut pending = requests.into_iter().peekable();
        while pending.peek().is_some() {
            let expired = |now: Instant| deadline.is_some_and(|d| now >= d);
            if expired(Instant::now()) || expired(self.pace_window().await) {
                warn!(remaining = pending.len(), "run deadline reached; not starting further fetch windows");
                outcome.deadline_hit = true;
                outcome.skipped.extend(pending);
                break;
            }

            let window: Vec<R> = pending.by_ref().take(batch_size).collect();
            let window_index = outcome.windows_run;

            let attempts = window.into_iter().map(|request| {
                let op = &op;
                let policy = &self.config.retry;
                let span = info_span!("source_request", window = window_index, request = ?request);
                async move {
                    let retried = retry_with_backoff(
                        policy,
                        SourceError::retry_disposition,
                        |_attempt| {
                            let call = op(request.clone());
                            async move {
                                match tokio::time::timeout(timeout, call).await {
                                    Ok(result) => result,
                                    Err(_) => Err(SourceError::Timeout(timeout)),
                                }
                            }
                        },
                    )
                    .await;
                    (request, retried)
                }
                .instrument(span)
            });

            for (request, retried) in join_all(attempts).await {
                match retried.result {
                    Ok(value) => outcome.successes.push((request, value)),
                    Err(error) => {
                        warn!(?request, attempts = retried.attempts, %error, "request failed; dropping its data");
                        outcome.failures.push(FetchFailure {
                            request,
                            error,
                            attempts: retried.attempts,
                        });
                    }
                }
            }
            outcome.windows_run += 1;

            if outcome.fatal_error().is_some() {
                outcome.skipped.extend(pending);
                break;
            }
        }

        outcome
    }
}
