//! Bounded-concurrency task runner with retry and backoff.
//!
//! [`TaskExecutor`] runs work items with at most `max_concurrency` attempts in
//! flight. Every item gets its own [`TaskOutcome`]; one failure never aborts
//! its siblings. Transient failures ([`AdaptError::is_transient`]) are retried
//! with exponential backoff, and the concurrency permit is released while an
//! item sleeps between attempts.
//!
//! An optional [`ErrorBudget`] stops issuing new work once more terminal
//! failures than allowed have been recorded. Work already in flight is
//! allowed to finish.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use adaptcrawl_shared::{AdaptError, ExecutorConfig, Result};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff: `min(base * 2^attempt, max)`, optionally ±25% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(factor).min(max_ms);

        if !self.jitter || capped < 4 {
            return Duration::from_millis(capped);
        }
        let spread = capped / 4;
        let jittered = capped - spread + fastrand::u64(0..=spread * 2);
        Duration::from_millis(jittered.min(max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Error budget
// ---------------------------------------------------------------------------

/// Shared count of terminal failures against a fixed limit.
///
/// The budget is exceeded once `used > limit`. Clones share the same counter.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    limit: usize,
    used: Arc<AtomicUsize>,
}

impl ErrorBudget {
    /// A budget of `limit` errors, `already_used` of which are spent.
    pub fn new(limit: usize, already_used: usize) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicUsize::new(already_used)),
        }
    }

    /// Count one failure. Returns `true` when this pushes the budget over.
    pub fn record_failure(&self) -> bool {
        let used = self.used.fetch_add(1, Ordering::SeqCst) + 1;
        if used == self.limit + 1 {
            error!(used, limit = self.limit, "error budget exceeded");
        }
        used > self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    pub fn is_exceeded(&self) -> bool {
        self.used() > self.limit
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one work item.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: AdaptError, attempts: u32 },
    /// Never started: the batch was cancelled or the error budget ran out.
    Skipped,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
            Self::Skipped => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Permits held for the duration of one attempt.
struct Permits {
    _global: OwnedSemaphorePermit,
    _local: Option<OwnedSemaphorePermit>,
}

/// Bounded-concurrency runner. Clones share the same concurrency limit.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    global: Arc<Semaphore>,
    local: Option<Arc<Semaphore>>,
    retry: RetryPolicy,
    chunk_size: usize,
    attempt_timeout: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            local: None,
            retry: RetryPolicy::from_config(config),
            chunk_size: config.chunk_size.max(1),
            attempt_timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fail any single attempt that runs longer than `limit`.
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// A handle sharing this executor's limit plus an extra cap of `limit`.
    pub fn narrowed(&self, limit: usize) -> Self {
        let mut narrowed = self.clone();
        narrowed.local = Some(Arc::new(Semaphore::new(limit.max(1))));
        narrowed
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run a single item with retries (fetch-with-retry).
    pub async fn run_one<I, T, F, Fut>(&self, item: I, worker: F) -> TaskOutcome<T>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let stop = CancellationToken::new();
        self.attempt_loop(item, &worker, &stop, None).await
    }

    /// Run every item, returning outcomes in input order.
    ///
    /// Items are processed in chunks of `chunk_size`; cancellation is checked
    /// before each chunk and before each attempt. Terminal failures are
    /// charged to `budget`, and once it is exceeded the remaining items are
    /// returned as [`TaskOutcome::Skipped`].
    pub async fn run_batch<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        token: &CancellationToken,
        budget: Option<&ErrorBudget>,
        worker: F,
    ) -> Vec<TaskOutcome<T>>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = items.len();
        let stop = token.child_token();
        if budget.is_some_and(ErrorBudget::is_exceeded) {
            stop.cancel();
        }

        let mut outcomes: Vec<TaskOutcome<T>> = Vec::with_capacity(total);
        let mut remaining = items.into_iter();

        loop {
            let chunk: Vec<I> = remaining.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            if stop.is_cancelled() {
                outcomes.extend(chunk.iter().map(|_| TaskOutcome::Skipped));
                continue;
            }

            let mut slots: Vec<Option<TaskOutcome<T>>> = chunk.iter().map(|_| None).collect();
            let mut set = JoinSet::new();
            for (offset, item) in chunk.into_iter().enumerate() {
                let executor = self.clone();
                let worker = worker.clone();
                let stop = stop.clone();
                let budget = budget.cloned();
                set.spawn(async move {
                    let outcome = executor
                        .attempt_loop(item, &worker, &stop, budget.as_ref())
                        .await;
                    (offset, outcome)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((offset, outcome)) => slots[offset] = Some(outcome),
                    Err(e) => warn!(error = %e, "batch task did not complete"),
                }
            }

            outcomes.extend(slots.into_iter().map(|slot| {
                slot.unwrap_or_else(|| TaskOutcome::Failed {
                    error: AdaptError::Internal("batch task panicked".into()),
                    attempts: 1,
                })
            }));
            debug!(done = outcomes.len(), total, "batch chunk finished");
        }

        outcomes
    }

    async fn acquire(&self, stop: &CancellationToken) -> Option<Permits> {
        if stop.is_cancelled() {
            return None;
        }

        let local = match &self.local {
            Some(sem) => {
                let permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    permit = sem.clone().acquire_owned() => permit.ok(),
                }?;
                Some(permit)
            }
            None => None,
        };

        let global = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            permit = self.global.clone().acquire_owned() => permit.ok(),
        }?;

        // Cancellation may have raced with the permit grant.
        if stop.is_cancelled() {
            return None;
        }
        Some(Permits {
            _global: global,
            _local: local,
        })
    }

    async fn attempt_loop<I, T, F, Fut>(
        &self,
        item: I,
        worker: &F,
        stop: &CancellationToken,
        budget: Option<&ErrorBudget>,
    ) -> TaskOutcome<T>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            let Some(permits) = self.acquire(stop).await else {
                return if attempts == 0 {
                    TaskOutcome::Skipped
                } else {
                    TaskOutcome::Failed {
                        error: AdaptError::Cancelled,
                        attempts,
                    }
                };
            };
            // A worker may charge the budget itself; stop before the next start.
            if attempts == 0 && budget.is_some_and(ErrorBudget::is_exceeded) {
                stop.cancel();
                return TaskOutcome::Skipped;
            }
            attempts += 1;

            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, worker(item.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(AdaptError::timeout("task attempt", limit)),
                },
                None => worker(item.clone()).await,
            };

            match result {
                Ok(value) => return TaskOutcome::Succeeded { value, attempts },
                Err(error) if error.is_transient() && attempts <= self.retry.max_retries => {
                    drop(permits);
                    let delay = self.retry.delay_for(attempts - 1);
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return TaskOutcome::Failed { error, attempts },
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    // Charged while the permit is held so no sibling starts
                    // before the budget sees this failure.
                    if budget.is_some_and(ErrorBudget::record_failure) {
                        stop.cancel();
                    }
                    debug!(attempts, error = %error, "task failed");
                    return TaskOutcome::Failed { error, attempts };
                }
            }
        }
    }
}
