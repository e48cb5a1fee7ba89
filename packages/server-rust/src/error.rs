//! Error types for the envelope.
//!
//! Generic primitives return their own typed errors ([`RetryError`],
//! [`BreakerError`], [`DeadlineExceeded`], [`Overloaded`]) so they can wrap any
//! operation. All of them convert into [`EnvelopeError`], the error type of
//! the request pipeline, so a handler can use `?` across the whole stack.

use std::time::Duration;

use envelope_core::ErrorKind;

/// Type-erased source error carried by transient and permanent failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// EnvelopeError
// ---------------------------------------------------------------------------

/// Failure surfaced by the request pipeline or a protected dependency call.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("transient failure: {0}")]
    Transient(#[source] BoxError),
    #[error("permanent failure: {0}")]
    Permanent(#[source] BoxError),
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<EnvelopeError>,
    },
    #[error("circuit breaker for {dependency} is open")]
    CircuitOpen {
        dependency: String,
        retry_in: Duration,
    },
    #[error("server overloaded, retry after {retry_after:?}")]
    Overloaded { retry_after: Duration },
    #[error("deadline of {budget:?} exceeded")]
    Timeout { budget: Duration },
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EnvelopeError {
    /// Wraps any error as a retryable failure.
    pub fn transient(err: impl Into<BoxError>) -> Self {
        Self::Transient(err.into())
    }

    /// Wraps any error as a non-retryable failure.
    pub fn permanent(err: impl Into<BoxError>) -> Self {
        Self::Permanent(err.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::RetryExhausted { .. } => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the retry executor may try again. An exhausted retry chain is
    /// never retried a second time.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// HTTP status a transport layer should answer with.
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.kind().transport_status())
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Suggested client back-off for overload and open-circuit responses.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Overloaded { retry_after } => Some(*retry_after),
            Self::CircuitOpen { retry_in, .. } if !retry_in.is_zero() => Some(*retry_in),
            _ => None,
        }
    }
}

impl From<&EnvelopeError> for ErrorKind {
    fn from(err: &EnvelopeError) -> Self {
        err.kind()
    }
}

// ---------------------------------------------------------------------------
// RetryError
// ---------------------------------------------------------------------------

/// Terminal failure of a [`RetryExecutor`](crate::resilience::RetryExecutor) run.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with an error the classifier refused to retry.
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    NotRetryable { attempts: u32, error: E },
    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The request deadline ran out, or would run out before another attempt
    /// could complete.
    #[error("deadline of {budget:?} exceeded after {attempts} attempts")]
    DeadlineExceeded {
        attempts: u32,
        budget: Duration,
        last: Option<E>,
    },
    /// The request was cancelled; no further attempt or sleep was started.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of attempts that were started.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NotRetryable { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

impl From<RetryError<EnvelopeError>> for EnvelopeError {
    fn from(err: RetryError<EnvelopeError>) -> Self {
        match err {
            RetryError::NotRetryable { error, .. } => error,
            RetryError::Exhausted { attempts, last } => Self::RetryExhausted {
                attempts,
                source: Box::new(last),
            },
            RetryError::DeadlineExceeded { budget, .. } => Self::Timeout { budget },
            RetryError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerError
// ---------------------------------------------------------------------------

/// Failure of a call made through a [`CircuitBreaker`](crate::resilience::CircuitBreaker).
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Fail-fast rejection; the operation was not invoked.
    #[error("circuit breaker for {dependency} is open")]
    Open {
        dependency: String,
        retry_in: Duration,
    },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

impl<E: Into<EnvelopeError>> From<BreakerError<E>> for EnvelopeError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open {
                dependency,
                retry_in,
            } => Self::CircuitOpen {
                dependency,
                retry_in,
            },
            BreakerError::Inner(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Deadline and admission failures
// ---------------------------------------------------------------------------

/// A [`TimeoutGuard`](crate::resilience::TimeoutGuard) deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {budget:?} exceeded")]
pub struct DeadlineExceeded {
    pub budget: Duration,
}

impl From<DeadlineExceeded> for EnvelopeError {
    fn from(err: DeadlineExceeded) -> Self {
        Self::Timeout { budget: err.budget }
    }
}

/// Admission denied by a [`LoadShedder`](crate::resilience::LoadShedder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("overloaded: {in_flight}/{limit} requests in flight")]
pub struct Overloaded {
    pub retry_after: Duration,
    pub in_flight: usize,
    pub limit: usize,
}

impl From<Overloaded> for EnvelopeError {
    fn from(err: Overloaded) -> Self {
        Self::Overloaded {
            retry_after: err.retry_after,
        }
    }
}
