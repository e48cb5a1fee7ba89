//! Envelope Core — SLO tiers, retry policy, circuit-breaker state machine and
//! the failure taxonomy shared by every reliability primitive.

pub mod backoff;
pub mod circuit;
pub mod context;
pub mod outcome;
pub mod slo;

pub use backoff::{PolicyError, RetryPolicy};
pub use circuit::{
    Admission, BreakerConfig, BreakerConfigError, BreakerCore, BreakerSnapshot, CircuitState,
    Ticket, Transition,
};
pub use context::CorrelationId;
pub use outcome::{ErrorKind, Outcome};
pub use slo::{LatencyTargets, SloError, SloTable, SloTargets, SloTier};
