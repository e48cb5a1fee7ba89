//! Reliability primitives that wrap an arbitrary async operation.
//!
//! They compose by nesting: a dependency call is typically
//! `breaker.call(|| retry.execute_within(name, &deadline, op, is_retryable))`,
//! all of it bounded by the request's [`Deadline`].

pub mod circuit_breaker;
pub mod deadline;
pub mod load_shedder;
pub mod retry;

pub use circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerRegistry};
pub use deadline::{enforce, with_deadline, Deadline, Interrupted, TimeoutGuard};
pub use load_shedder::{AdmissionPermit, LoadShedder};
pub use retry::RetryExecutor;
