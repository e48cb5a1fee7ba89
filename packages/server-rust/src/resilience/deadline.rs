//! Request deadlines and the timeout guard.
//!
//! A [`Deadline`] is computed once at request entry and fixed for the life of
//! the request. It pairs an absolute expiry instant with a cooperative
//! [`CancellationToken`]: nested work (retries, dependency calls) treats the
//! instant as a hard ceiling on its own waiting and watches the token to stop
//! early. [`TimeoutGuard`] enforces the deadline on an operation and cancels
//! the token when it fires; it never force-kills the underlying task.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DeadlineExceeded;

/// Upper bound used when `now + budget` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Why a deadline-bound wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Expired,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Absolute expiry plus a cancellation signal, shared by every stage of a
/// request.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
    token: CancellationToken,
}

impl Deadline {
    /// A deadline `budget` from now with a fresh cancellation token.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self::with_token(budget, CancellationToken::new())
    }

    /// A deadline `budget` from now that shares an existing token.
    #[must_use]
    pub fn with_token(budget: Duration, token: CancellationToken) -> Self {
        let now = Instant::now();
        let expires_at = now
            .checked_add(budget)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self {
            expires_at,
            budget,
            token,
        }
    }

    /// A nested deadline that never outlives this one. Cancelling the parent
    /// cancels the child, not the reverse.
    #[must_use]
    pub fn child(&self, budget: Duration) -> Self {
        let mut child = Self::with_token(budget, self.token.child_token());
        if child.expires_at > self.expires_at {
            child.expires_at = self.expires_at;
            child.budget = self.remaining();
        }
        child
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// The total budget this deadline was created with.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signals cancellation to everything sharing this deadline.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs `fut` until it completes, the deadline expires, or the token is
    /// cancelled. The future is dropped on interruption.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] when the future did not complete in time.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Interrupted::Cancelled),
            res = tokio::time::timeout_at(self.expires_at, fut) => res.map_err(|_| Interrupted::Expired),
        }
    }

    /// Suspends the current task for `delay` without blocking the worker,
    /// waking early on cancellation or expiry.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the wait was cut short.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(delay)).await
    }
}

// ---------------------------------------------------------------------------
// TimeoutGuard
// ---------------------------------------------------------------------------

/// Enforces a fixed budget on an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    budget: Duration,
}

impl TimeoutGuard {
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Runs `op` under a fresh deadline of this guard's budget.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineExceeded`] when `op` has not completed in time.
    pub async fn run<F, Fut>(&self, op: F) -> Result<Fut::Output, DeadlineExceeded>
    where
        F: FnOnce(Deadline) -> Fut,
        Fut: Future,
    {
        enforce(Deadline::after(self.budget), op).await
    }
}

/// Runs `op` with a deadline of `budget`, cancelling it on expiry.
///
/// # Errors
///
/// Returns [`DeadlineExceeded`] when `op` has not completed in time.
pub async fn with_deadline<F, Fut>(budget: Duration, op: F) -> Result<Fut::Output, DeadlineExceeded>
where
    F: FnOnce(Deadline) -> Fut,
    Fut: Future,
{
    TimeoutGuard::new(budget).run(op).await
}

/// Runs `op` against an existing deadline.
///
/// The deadline's token is cancelled if the deadline fires or if the returned
/// future is dropped before `op` completes, so work spawned under the token
/// is not leaked.
///
/// # Errors
///
/// Returns [`DeadlineExceeded`] when `op` has not completed in time.
pub async fn enforce<F, Fut>(deadline: Deadline, op: F) -> Result<Fut::Output, DeadlineExceeded>
where
    F: FnOnce(Deadline) -> Fut,
    Fut: Future,
{
    let cancel_on_drop = deadline.token().clone().drop_guard();
    let expires_at = deadline.expires_at();
    let budget = deadline.budget();

    if let Ok(output) = tokio::time::timeout_at(expires_at, op(deadline)).await {
        cancel_on_drop.disarm();
        Ok(output)
    } else {
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(budget_ms, "deadline exceeded, cancelling operation");
        drop(cancel_on_drop);
        Err(DeadlineExceeded { budget })
    }
}
