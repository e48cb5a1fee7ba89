//! Per-dependency circuit breakers.
//!
//! [`CircuitBreaker`] wraps the pure [`BreakerCore`] state machine in a mutex
//! and drives it from async calls. The lock is held only for admission and
//! for recording a verdict, never across the protected call, so unrelated
//! dependencies and concurrent callers of the same dependency do not
//! serialize on each other's I/O.
//!
//! Every admission carries a generation-tagged ticket. Verdicts from calls
//! admitted before the latest transition are ignored, which keeps state
//! changes totally ordered even when slow calls finish late.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use envelope_core::{Admission, BreakerConfig, BreakerCore, CircuitState, Ticket, Transition};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::BreakerError;
use crate::observability::{names, Label, SharedSink};

// ---------------------------------------------------------------------------
// BreakerStatus
// ---------------------------------------------------------------------------

/// Serializable view of one breaker, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub trials_in_flight: u32,
    pub since_transition_ms: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    name: String,
    core: Mutex<BreakerCore>,
    epoch: Instant,
    sink: SharedSink,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("core", &*self.core.lock())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for the dependency `name` and publishes its
    /// initial state gauge.
    pub fn new(name: impl Into<String>, config: BreakerConfig, sink: SharedSink) -> Self {
        let breaker = Self {
            name: name.into(),
            core: Mutex::new(BreakerCore::new(config, 0)),
            epoch: Instant::now(),
            sink,
        };
        breaker.publish_state(CircuitState::Closed);
        breaker
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.core.lock().state()
    }

    #[must_use]
    pub fn config(&self) -> BreakerConfig {
        *self.core.lock().config()
    }

    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let (snapshot, config) = {
            let core = self.core.lock();
            (core.snapshot(), *core.config())
        };
        BreakerStatus {
            name: self.name.clone(),
            state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
            consecutive_successes: snapshot.consecutive_successes,
            trials_in_flight: snapshot.trials_in_flight,
            since_transition_ms: self.now_ms().saturating_sub(snapshot.last_transition_ms),
            failure_threshold: config.failure_threshold,
            recovery_timeout_ms: u64::try_from(config.recovery_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Runs `op` through the breaker. Every error counts as a dependency
    /// failure.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] without invoking `op` while gating, otherwise
    /// [`BreakerError::Inner`] with the operation's own error.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(op, |_| true).await
    }

    /// Runs `op` through the breaker, counting only errors for which
    /// `is_failure` returns true. Other errors are returned unchanged and
    /// neither trip nor heal the breaker.
    ///
    /// If the returned future is dropped before `op` completes, the call
    /// counts as neither success nor failure and its half-open trial slot is
    /// freed.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_classified<T, E, F, Fut, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let ticket = self.acquire().map_err(|retry_in| BreakerError::Open {
            dependency: self.name.clone(),
            retry_in,
        })?;
        let guard = CallGuard {
            breaker: self,
            ticket: Some(ticket),
        };

        match op().await {
            Ok(value) => {
                guard.succeed();
                Ok(value)
            }
            Err(error) => {
                if is_failure(&error) {
                    guard.fail();
                } else {
                    guard.abandon();
                }
                Err(BreakerError::Inner(error))
            }
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn acquire(&self) -> Result<Ticket, Duration> {
        let admission = {
            let mut core = self.core.lock();
            let (admission, transition) = core.try_acquire(self.now_ms());
            self.on_transition(transition);
            admission
        };
        match admission {
            Admission::Admitted(ticket) => Ok(ticket),
            Admission::Rejected { retry_in } => {
                self.sink
                    .increment_counter(names::BREAKER_REJECTIONS_TOTAL, &self.labels(), 1);
                tracing::debug!(
                    dependency = %self.name,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    "circuit open, failing fast"
                );
                Err(retry_in)
            }
        }
    }

    fn record_success(&self, ticket: Ticket) {
        let mut core = self.core.lock();
        let transition = core.on_success(ticket, self.now_ms());
        self.on_transition(transition);
    }

    fn record_failure(&self, ticket: Ticket) {
        let mut core = self.core.lock();
        let (counted, transition) = core.on_failure(ticket, self.now_ms());
        if counted {
            self.sink
                .increment_counter(names::BREAKER_FAILURES_TOTAL, &self.labels(), 1);
        }
        self.on_transition(transition);
    }

    fn record_abandon(&self, ticket: Ticket) {
        self.core.lock().on_abandon(ticket);
    }

    /// Called with the core lock held so gauge updates follow transition
    /// order.
    fn on_transition(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        match to {
            CircuitState::Open => {
                tracing::warn!(dependency = %self.name, %from, %to, "circuit breaker opened");
            }
            CircuitState::HalfOpen | CircuitState::Closed => {
                tracing::info!(dependency = %self.name, %from, %to, "circuit breaker state change");
            }
        }
        self.publish_state(to);
    }

    fn publish_state(&self, state: CircuitState) {
        self.sink
            .set_gauge(names::BREAKER_STATE, &self.labels(), state.gauge_value());
    }

    fn labels(&self) -> [Label; 1] {
        [("dependency", self.name.clone())]
    }
}

/// Holds an admission ticket for the duration of a call and returns it to the
/// breaker with the call's verdict. Dropped without a verdict, the call is
/// abandoned.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Option<Ticket>,
}

impl CallGuard<'_> {
    fn succeed(mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.record_success(ticket);
        }
    }

    fn fail(mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.record_failure(ticket);
        }
    }

    fn abandon(self) {}
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.record_abandon(ticket);
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerRegistry
// ---------------------------------------------------------------------------

/// Memoized breakers keyed by dependency name. Each breaker is created on
/// first use and lives as long as the registry.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    sink: SharedSink,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig, sink: SharedSink) -> Self {
        Self {
            config,
            sink,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `name`, created with the default config on first use.
    /// Concurrent first calls for the same name get the same instance.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let config = self.config;
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.sink))))
                .value(),
        )
    }

    /// Registers `name` with its own thresholds. An existing breaker is kept
    /// as is.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.sink))))
                .value(),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Status of every breaker, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        let mut statuses: Vec<BreakerStatus> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::observability::InMemorySink;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(10),
            success_threshold: 2,
            half_open_max_trials: 1,
        }
    }

    fn breaker() -> (CircuitBreaker, Arc<InMemorySink>) {
        let sink = Arc::new(InMemorySink::new());
        (CircuitBreaker::new("db", config(), sink.clone()), sink)
    }

    async fn fail(breaker: &CircuitBreaker) -> BreakerError<&'static str> {
        breaker
            .call(|| async { Err::<(), _>("down") })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Ok(()) }).await
    }

    fn gauge(sink: &InMemorySink) -> Option<f64> {
        sink.gauge(names::BREAKER_STATE, &[("dependency", "db")])
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_failure_opens_and_sixth_call_is_not_invoked() {
        let (breaker, sink) = breaker();
        assert_eq!(gauge(&sink), Some(0.0));

        for _ in 0..4 {
            assert!(!fail(&breaker).await.is_open());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(gauge(&sink), Some(1.0));

        let invoked = AtomicU32::new(0);
        let err = breaker
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(
            sink.counter(names::BREAKER_FAILURES_TOTAL, &[("dependency", "db")]),
            5
        );
        assert_eq!(
            sink.counter(names::BREAKER_REJECTIONS_TOTAL, &[("dependency", "db")]),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejection_reports_time_left() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(4)).await;
        match fail(&breaker).await {
            BreakerError::Open { dependency, retry_in } => {
                assert_eq!(dependency, "db");
                assert_eq!(retry_in, Duration::from_secs(6));
            }
            BreakerError::Inner(_) => panic!("expected fail-fast"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_recovers_after_success_threshold() {
        let (breaker, sink) = breaker();
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(gauge(&sink), Some(2.0));

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(gauge(&sink), Some(0.0));
        assert_eq!(breaker.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!fail(&breaker).await.is_open());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(fail(&breaker).await.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_at_a_time() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial = breaker.call(|| async move {
            wait.await.ok();
            Ok::<_, &str>(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let err = breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap_err();
            release.send(()).ok();
            err
        };
        let (trial, second) = tokio::join!(trial, second);
        assert!(trial.is_ok());
        assert!(second.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.status().consecutive_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_its_slot_without_verdict() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let hung = breaker.call(|| std::future::pending::<Result<(), &str>>());
        assert!(tokio::time::timeout(Duration::from_millis(10), hung).await.is_err());
        let status = breaker.status();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!(status.trials_in_flight, 0);
        assert_eq!(status.consecutive_successes, 0);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().consecutive_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_errors_do_not_trip() {
        let (breaker, sink) = breaker();
        for _ in 0..10 {
            let err = breaker
                .call_classified(|| async { Err::<(), _>("not found") }, |_| false)
                .await
                .unwrap_err();
            assert_eq!(err.into_inner(), Some("not found"));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(sink.counter_total(names::BREAKER_FAILURES_TOTAL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        succeed(&breaker).await.unwrap();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_memoizes_by_name() {
        let registry = CircuitBreakerRegistry::new(config(), Arc::new(InMemorySink::new()));
        let a = registry.get_or_create("payments");
        let b = registry.get_or_create("payments");
        let c = registry.get_or_create("search");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);

        let custom = BreakerConfig {
            failure_threshold: 1,
            ..config()
        };
        let kept = registry.register("payments", custom);
        assert!(Arc::ptr_eq(&a, &kept));
        assert_eq!(kept.config().failure_threshold, 5);

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["payments", "search"]);
    }

    #[tokio::test]
    async fn registry_first_use_is_race_free() {
        let registry = Arc::new(CircuitBreakerRegistry::new(
            config(),
            Arc::new(InMemorySink::new()),
        ));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("cache") })
            })
            .collect();
        let mut breakers = Vec::new();
        for handle in handles {
            breakers.push(handle.await.unwrap());
        }
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn status_serializes() {
        let (breaker, _) = breaker();
        let json = serde_json::to_value(breaker.status()).unwrap();
        assert_eq!(json["name"], "db");
        assert_eq!(json["state"], "closed");
        assert_eq!(json["failure_threshold"], 5);
    }
}
