//! Circuit breaker state machine.
//!
//! [`BreakerCore`] holds the per-dependency state and applies the transition
//! rules. It performs no I/O and reads no clock: callers pass a monotonic
//! millisecond timestamp into every method, and are responsible for
//! serializing access (the async wrapper keeps it behind a mutex).
//!
//! ```text
//! CLOSED    --consecutive failures >= failure_threshold--> OPEN
//! OPEN      --next call after recovery_timeout-----------> HALF_OPEN
//! HALF_OPEN --consecutive successes >= success_threshold-> CLOSED
//! HALF_OPEN --any failure--------------------------------> OPEN
//! ```
//!
//! Every admitted call receives a [`Ticket`] stamped with the current
//! generation. Each transition bumps the generation, so results reported with
//! an older ticket are ignored. This is how in-flight trial accounting is
//! discarded when a half-open probe fails.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Encoding used by the breaker-state gauge.
    #[must_use]
    pub fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors from validating a [`BreakerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerConfigError {
    #[error("{0} must be >= 1")]
    ZeroThreshold(&'static str),
    #[error("recovery_timeout must be non-zero")]
    ZeroRecoveryTimeout,
}

/// Breaker thresholds, shared by every breaker built from the same config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    /// Maximum concurrent trial calls while half-open.
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_trials: 1,
        }
    }
}

impl BreakerConfig {
    /// # Errors
    ///
    /// Returns the first zero threshold or a zero recovery timeout.
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroThreshold("failure_threshold"));
        }
        if self.success_threshold == 0 {
            return Err(BreakerConfigError::ZeroThreshold("success_threshold"));
        }
        if self.half_open_max_trials == 0 {
            return Err(BreakerConfigError::ZeroThreshold("half_open_max_trials"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(BreakerConfigError::ZeroRecoveryTimeout);
        }
        Ok(())
    }

    fn recovery_timeout_ms(&self) -> u64 {
        u64::try_from(self.recovery_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Proof of admission for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
    trial: bool,
}

impl Ticket {
    /// Whether this call is a half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Result of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(Ticket),
    /// Fail fast. `retry_in` is the time left until the breaker will admit a
    /// trial (zero when half-open trials are merely saturated).
    Rejected { retry_in: Duration },
}

/// A state change applied by the last call into [`BreakerCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub trials_in_flight: u32,
    pub last_transition_ms: u64,
}

/// The per-dependency breaker state and its transition rules.
#[derive(Debug, Clone)]
pub struct BreakerCore {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trials_in_flight: u32,
    last_transition_ms: u64,
    generation: u64,
}

impl BreakerCore {
    /// A closed breaker created at `now_ms`.
    #[must_use]
    pub fn new(config: BreakerConfig, now_ms: u64) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            trials_in_flight: 0,
            last_transition_ms: now_ms,
            generation: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            trials_in_flight: self.trials_in_flight,
            last_transition_ms: self.last_transition_ms,
        }
    }

    /// Decides whether a call may proceed. The OPEN -> HALF_OPEN transition
    /// happens here, on the first call after the recovery timeout.
    pub fn try_acquire(&mut self, now_ms: u64) -> (Admission, Option<Transition>) {
        let mut transition = None;
        if self.state == CircuitState::Open {
            let elapsed = now_ms.saturating_sub(self.last_transition_ms);
            let timeout = self.config.recovery_timeout_ms();
            if elapsed < timeout {
                let retry_in = Duration::from_millis(timeout - elapsed);
                return (Admission::Rejected { retry_in }, None);
            }
            transition = Some(self.transition(CircuitState::HalfOpen, now_ms));
        }

        let admission = match self.state {
            CircuitState::Closed => Admission::Admitted(self.ticket(false)),
            CircuitState::HalfOpen if self.trials_in_flight < self.config.half_open_max_trials => {
                self.trials_in_flight += 1;
                Admission::Admitted(self.ticket(true))
            }
            CircuitState::HalfOpen | CircuitState::Open => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
        };
        (admission, transition)
    }

    /// Records a successful call.
    pub fn on_success(&mut self, ticket: Ticket, now_ms: u64) -> Option<Transition> {
        if ticket.generation != self.generation {
            return None;
        }
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.release_trial(ticket);
                self.consecutive_successes += 1;
                (self.consecutive_successes >= self.config.success_threshold)
                    .then(|| self.transition(CircuitState::Closed, now_ms))
            }
            CircuitState::Open => None,
        }
    }

    /// Records a failed call. Returns whether the failure was counted along
    /// with any transition it caused.
    pub fn on_failure(&mut self, ticket: Ticket, now_ms: u64) -> (bool, Option<Transition>) {
        if ticket.generation != self.generation {
            return (false, None);
        }
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                let tripped = self.consecutive_failures >= self.config.failure_threshold;
                (true, tripped.then(|| self.transition(CircuitState::Open, now_ms)))
            }
            CircuitState::HalfOpen => (true, Some(self.transition(CircuitState::Open, now_ms))),
            CircuitState::Open => (false, None),
        }
    }

    /// Records a call that ended without a verdict (cancelled, or an error that
    /// does not count against the dependency). Frees its trial slot only.
    pub fn on_abandon(&mut self, ticket: Ticket) {
        if ticket.generation == self.generation && self.state == CircuitState::HalfOpen {
            self.release_trial(ticket);
        }
    }

    fn ticket(&self, trial: bool) -> Ticket {
        Ticket {
            generation: self.generation,
            trial,
        }
    }

    fn release_trial(&mut self, ticket: Ticket) {
        if ticket.trial {
            self.trials_in_flight = self.trials_in_flight.saturating_sub(1);
        }
    }

    fn transition(&mut self, to: CircuitState, now_ms: u64) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_transition_ms = now_ms;
        self.generation += 1;
        self.trials_in_flight = 0;
        match to {
            CircuitState::Closed | CircuitState::Open => self.consecutive_failures = 0,
            CircuitState::HalfOpen => self.consecutive_successes = 0,
        }
        Transition { from, to }
    }
}
