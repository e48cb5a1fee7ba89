//! Envelope Server — retry, circuit breaking, load shedding, deadlines and the
//! tower request pipeline that composes them.

pub mod config;
pub mod error;
pub mod observability;
pub mod resilience;
pub mod service;
pub mod transport;

pub use config::{ConfigError, EnvelopeConfig};
pub use error::{BreakerError, DeadlineExceeded, EnvelopeError, Overloaded, RetryError};
pub use observability::{MetricsSink, SharedSink};
pub use resilience::{
    CircuitBreaker, CircuitBreakerRegistry, Deadline, LoadShedder, RetryExecutor, TimeoutGuard,
};
pub use service::{Envelope, Failure, Reply, Request, SloClassifier};
