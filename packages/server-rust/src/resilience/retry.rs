//! Retry with exponential backoff and full jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use envelope_core::RetryPolicy;
use tokio::time::Instant;

use crate::error::RetryError;
use crate::observability::{names, Label, SharedSink};
use crate::resilience::deadline::{Deadline, Interrupted};

/// Terminal outcomes recorded on `envelope_retry_outcomes_total`.
mod outcome {
    pub const SUCCEEDED: &str = "succeeded";
    pub const EXHAUSTED: &str = "exhausted";
    pub const NOT_RETRYABLE: &str = "not_retryable";
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    pub const CANCELLED: &str = "cancelled";
}

/// Runs an operation under a [`RetryPolicy`].
///
/// Only errors the caller's classifier marks retryable are retried. Between
/// attempts the task sleeps on the tokio timer, so other requests keep running
/// on the same worker.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sink: SharedSink,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy, sink: SharedSink) -> Self {
        Self { policy, sink }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invokes `op` until it succeeds, fails with a non-retryable error, or
    /// the policy's attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::NotRetryable`] or [`RetryError::Exhausted`].
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        operation: &str,
        op: F,
        is_retryable: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        self.run(operation, None, op, is_retryable).await
    }

    /// Like [`execute`](Self::execute), but bounded by `deadline`.
    ///
    /// Cancellation and expiry are checked before every attempt, each attempt
    /// is cut off at the deadline, and no backoff sleep is started that the
    /// next attempt could not finish within. The duration of the previous
    /// attempt is used as the estimate for the next one.
    ///
    /// # Errors
    ///
    /// Additionally returns [`RetryError::DeadlineExceeded`] and
    /// [`RetryError::Cancelled`].
    pub async fn execute_within<T, E, F, Fut, C>(
        &self,
        operation: &str,
        deadline: &Deadline,
        op: F,
        is_retryable: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        self.run(operation, Some(deadline), op, is_retryable).await
    }

    async fn run<T, E, F, Fut, C>(
        &self,
        operation: &str,
        deadline: Option<&Deadline>,
        mut op: F,
        is_retryable: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempts: u32 = 0;
        loop {
            if let Some(deadline) = deadline {
                if deadline.is_cancelled() {
                    return Err(self.finish(operation, RetryError::Cancelled { attempts }));
                }
                if deadline.is_expired() {
                    return Err(self.finish(
                        operation,
                        RetryError::DeadlineExceeded {
                            attempts,
                            budget: deadline.budget(),
                            last: None,
                        },
                    ));
                }
            }

            attempts += 1;
            self.sink.increment_counter(
                names::RETRY_ATTEMPTS_TOTAL,
                &[
                    ("operation", operation.to_string()),
                    ("attempt", attempts.to_string()),
                ],
                1,
            );

            let started = Instant::now();
            let result = match deadline {
                None => op().await,
                Some(deadline) => match deadline.run(op()).await {
                    Ok(result) => result,
                    Err(interrupted) => {
                        return Err(self.finish(operation, interrupted_error(interrupted, attempts, deadline)));
                    }
                },
            };
            let attempt_took = started.elapsed();

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        self.record_outcome(operation, outcome::SUCCEEDED, attempts);
                        tracing::info!(operation, attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(self.finish(operation, RetryError::NotRetryable { attempts, error }));
            }

            if !self.policy.allows_retry_after(attempts - 1) {
                tracing::error!(
                    operation,
                    attempts,
                    error = %error,
                    "retries exhausted"
                );
                return Err(self.finish(operation, RetryError::Exhausted { attempts, last: error }));
            }

            let delay = self.policy.sample_delay(attempts - 1, &mut rand::rng());

            if let Some(deadline) = deadline {
                if deadline.is_cancelled() {
                    return Err(self.finish(operation, RetryError::Cancelled { attempts }));
                }
                if delay + attempt_took > deadline.remaining() {
                    tracing::warn!(
                        operation,
                        attempts,
                        delay_ms = millis(delay),
                        remaining_ms = millis(deadline.remaining()),
                        "not retrying, next attempt cannot finish before the deadline"
                    );
                    return Err(self.finish(
                        operation,
                        RetryError::DeadlineExceeded {
                            attempts,
                            budget: deadline.budget(),
                            last: Some(error),
                        },
                    ));
                }
            }

            tracing::warn!(
                operation,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = millis(delay),
                error = %error,
                "retrying after failure"
            );

            match deadline {
                None => tokio::time::sleep(delay).await,
                Some(deadline) => {
                    if let Err(interrupted) = deadline.sleep(delay).await {
                        return Err(self.finish(operation, interrupted_error(interrupted, attempts, deadline)));
                    }
                }
            }
        }
    }

    /// Records the terminal outcome of a failed run and hands the error back.
    fn finish<E>(&self, operation: &str, error: RetryError<E>) -> RetryError<E> {
        let outcome = match &error {
            RetryError::NotRetryable { .. } => outcome::NOT_RETRYABLE,
            RetryError::Exhausted { .. } => outcome::EXHAUSTED,
            RetryError::DeadlineExceeded { .. } => outcome::DEADLINE_EXCEEDED,
            RetryError::Cancelled { .. } => outcome::CANCELLED,
        };
        self.record_outcome(operation, outcome, error.attempts());
        error
    }

    fn record_outcome(&self, operation: &str, outcome: &'static str, attempts: u32) {
        let labels: [Label; 3] = [
            ("operation", operation.to_string()),
            ("outcome", outcome.to_string()),
            ("attempts", attempts.to_string()),
        ];
        self.sink
            .increment_counter(names::RETRY_OUTCOMES_TOTAL, &labels, 1);
    }
}

fn interrupted_error<E>(interrupted: Interrupted, attempts: u32, deadline: &Deadline) -> RetryError<E> {
    match interrupted {
        Interrupted::Cancelled => RetryError::Cancelled { attempts },
        Interrupted::Expired => RetryError::DeadlineExceeded {
            attempts,
            budget: deadline.budget(),
            last: None,
        },
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::EnvelopeError;
    use crate::observability::InMemorySink;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            false,
        )
        .unwrap()
    }

    fn executor(max_attempts: u32) -> (RetryExecutor, Arc<InMemorySink>) {
        let sink = Arc::new(InMemorySink::new());
        (RetryExecutor::new(policy(max_attempts), sink.clone()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_max_attempts() {
        let (retry, sink) = executor(3);
        let calls = AtomicU32::new(0);
        let err = retry
            .execute(
                "fetch",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(EnvelopeError::transient("reset")) }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(sink.counter_total(names::RETRY_ATTEMPTS_TOTAL), 3);
        assert_eq!(
            sink.counter(names::RETRY_ATTEMPTS_TOTAL, &[("operation", "fetch"), ("attempt", "3")]),
            1
        );
        assert_eq!(
            sink.counter(
                names::RETRY_OUTCOMES_TOTAL,
                &[("operation", "fetch"), ("outcome", "exhausted"), ("attempts", "3")]
            ),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let (retry, _) = executor(5);
        let calls = AtomicU32::new(0);
        let err = retry
            .execute(
                "validate",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(EnvelopeError::permanent("bad input")) }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::NotRetryable { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_retries() {
        let (retry, _) = executor(1);
        let calls = AtomicU32::new(0);
        let err = retry
            .execute(
                "once",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(EnvelopeError::transient("x")) }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures_and_waits_backoff() {
        let (retry, sink) = executor(4);
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let value = retry
            .execute(
                "flaky",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(EnvelopeError::transient("blip"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap();
        assert_eq!(value, 2);
        // 100ms then 200ms between the three attempts.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(
            sink.counter(
                names::RETRY_OUTCOMES_TOTAL,
                &[("operation", "flaky"), ("outcome", "succeeded"), ("attempts", "3")]
            ),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_success_records_attempt_only() {
        let (retry, sink) = executor(3);
        let out: Result<u8, RetryError<EnvelopeError>> = retry
            .execute("ok", || async { Ok(1) }, EnvelopeError::is_retryable)
            .await;
        assert_eq!(out.unwrap(), 1);
        assert_eq!(sink.counter_total(names::RETRY_ATTEMPTS_TOTAL), 1);
        assert_eq!(sink.counter_total(names::RETRY_OUTCOMES_TOTAL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_before_an_attempt_that_cannot_finish() {
        // 200ms budget; each attempt takes 150ms. After the first attempt only
        // 50ms remain, so no second attempt is started.
        let (retry, _) = executor(3);
        let calls = AtomicU32::new(0);
        let deadline = Deadline::after(Duration::from_millis(200));
        let start = Instant::now();
        let err = retry
            .execute_within(
                "slow",
                &deadline,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Err::<(), _>(EnvelopeError::transient("slow"))
                    }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::DeadlineExceeded { attempts: 1, last: Some(_), .. }));
        assert!(start.elapsed() <= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_is_cut_off_at_the_deadline() {
        let (retry, _) = executor(3);
        let deadline = Deadline::after(Duration::from_millis(100));
        let start = Instant::now();
        let err = retry
            .execute_within(
                "hang",
                &deadline,
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, EnvelopeError>(())
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::DeadlineExceeded { attempts: 1, last: None, .. }));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deadline_starts_no_attempt() {
        let (retry, sink) = executor(3);
        let deadline = Deadline::after(Duration::from_secs(1));
        deadline.cancel();
        let calls = AtomicU32::new(0);
        let err = retry
            .execute_within(
                "never",
                &deadline,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, EnvelopeError>(()) }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, RetryError::Cancelled { attempts: 0 }));
        assert_eq!(
            sink.counter(
                names::RETRY_OUTCOMES_TOTAL,
                &[("operation", "never"), ("outcome", "cancelled"), ("attempts", "0")]
            ),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_ends_the_sleep() {
        let sink = Arc::new(InMemorySink::new());
        let long_backoff = RetryPolicy::new(
            3,
            Duration::from_secs(2),
            2.0,
            Duration::from_secs(10),
            false,
        )
        .unwrap();
        let retry = RetryExecutor::new(long_backoff, sink);
        let deadline = Deadline::after(Duration::from_secs(30));
        let canceller = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let err = retry
            .execute_within(
                "cancel-me",
                &deadline,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(EnvelopeError::transient("down")) }
                },
                EnvelopeError::is_retryable,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
