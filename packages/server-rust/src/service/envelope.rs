//! The assembled envelope: every primitive built once from configuration and
//! shared by the request pipeline and by handlers calling dependencies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use envelope_core::RetryPolicy;

use crate::config::{ConfigError, EnvelopeConfig};
use crate::error::{EnvelopeError, RetryError};
use crate::observability::SharedSink;
use crate::resilience::{CircuitBreakerRegistry, Deadline, LoadShedder, RetryExecutor};
use crate::service::classify::SloClassifier;
use crate::service::middleware::{build_pipeline, Pipeline};

/// Shared reliability state for one process.
///
/// Cheap to clone; clones share the same shedder, breakers and classifier.
#[derive(Clone)]
pub struct Envelope {
    classifier: Arc<SloClassifier>,
    shedder: Arc<LoadShedder>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    sink: SharedSink,
    default_timeout: Duration,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("classifier", &self.classifier)
            .field("shedder", &self.shedder)
            .field("retry", &self.retry)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Envelope {
    #[must_use]
    pub fn new(
        classifier: SloClassifier,
        shedder: LoadShedder,
        breakers: CircuitBreakerRegistry,
        retry_policy: RetryPolicy,
        sink: SharedSink,
        default_timeout: Duration,
    ) -> Self {
        Self {
            classifier: Arc::new(classifier),
            shedder: Arc::new(shedder),
            breakers: Arc::new(breakers),
            retry: RetryExecutor::new(retry_policy, Arc::clone(&sink)),
            sink,
            default_timeout,
        }
    }

    /// Validates `config` and builds every primitive from it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first invalid setting.
    pub fn from_config(config: &EnvelopeConfig, sink: SharedSink) -> Result<Self, ConfigError> {
        config.validate()?;
        let breakers = CircuitBreakerRegistry::new(config.breaker_config()?, Arc::clone(&sink));
        Ok(Self::new(
            config.classifier()?,
            config.load_shedder(),
            breakers,
            config.retry_policy()?,
            sink,
            config.http_timeout,
        ))
    }

    #[must_use]
    pub fn classifier(&self) -> &Arc<SloClassifier> {
        &self.classifier
    }

    #[must_use]
    pub fn shedder(&self) -> &Arc<LoadShedder> {
        &self.shedder
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    #[must_use]
    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Budget for requests the classifier has not tiered.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Wraps `handler` in the full request pipeline.
    pub fn pipeline<S>(&self, handler: S) -> Pipeline<S> {
        build_pipeline(handler, self)
    }

    /// Calls a downstream dependency through its circuit breaker, retrying
    /// transient failures within `deadline`.
    ///
    /// The breaker sees one outcome per call, after retries: exhausted
    /// retries and deadline overruns count as dependency failures, while
    /// permanent errors and cancellation leave the breaker untouched.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` without invoking `op` while the breaker is gating,
    /// otherwise the retry chain's terminal error.
    pub async fn call_dependency<T, F, Fut>(
        &self,
        dependency: &str,
        deadline: Option<&Deadline>,
        op: F,
    ) -> Result<T, EnvelopeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EnvelopeError>>,
    {
        let breaker = self.breakers.get_or_create(dependency);
        let retry = &self.retry;
        breaker
            .call_classified(
                move || async move {
                    match deadline {
                        Some(deadline) => {
                            retry
                                .execute_within(dependency, deadline, op, EnvelopeError::is_retryable)
                                .await
                        }
                        None => retry.execute(dependency, op, EnvelopeError::is_retryable).await,
                    }
                },
                |err: &RetryError<EnvelopeError>| {
                    matches!(
                        err,
                        RetryError::Exhausted { .. } | RetryError::DeadlineExceeded { .. }
                    )
                },
            )
            .await
            .map_err(EnvelopeError::from)
    }
}
