//! Failure taxonomy and request outcomes.
//!
//! Every failure that leaves the envelope is classified into exactly one
//! [`ErrorKind`]. The kind drives three things: whether the retry executor may
//! recover it locally, which label it carries in metrics, and which transport
//! status a front-end maps it to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failure surfaced by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable failure. Only surfaces after retries are exhausted.
    Transient,
    /// Non-retryable business or validation failure.
    Permanent,
    /// A circuit breaker rejected the call without invoking the operation.
    CircuitOpen,
    /// Admission denied by the load shedder.
    Overloaded,
    /// The request deadline elapsed.
    Timeout,
    /// The caller went away before the operation finished.
    Cancelled,
    /// Unclassified fault.
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Transient,
        ErrorKind::Permanent,
        ErrorKind::CircuitOpen,
        ErrorKind::Overloaded,
        ErrorKind::Timeout,
        ErrorKind::Cancelled,
        ErrorKind::Internal,
    ];

    /// Label value used for this kind in metrics and logs.
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP-equivalent status code a transport layer should answer with.
    ///
    /// Overload, timeout and open-circuit responses stay distinguishable from
    /// business errors so clients can decide whether to retry.
    #[must_use]
    pub fn transport_status(self) -> u16 {
        match self {
            ErrorKind::Overloaded => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::CircuitOpen => 503,
            ErrorKind::Permanent => 400,
            ErrorKind::Transient | ErrorKind::Cancelled | ErrorKind::Internal => 500,
        }
    }

    /// Only transient failures are recovered locally.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Final outcome of a request or protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure(ErrorKind),
}

impl Outcome {
    /// Label value used for the `outcome` metric label.
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure(kind) => kind.as_label(),
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl<T, E> From<&Result<T, E>> for Outcome
where
    for<'a> &'a E: Into<ErrorKind>,
{
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}
