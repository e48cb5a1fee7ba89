//! Outcome metrics middleware.
//!
//! Records RED metrics for every request that reaches it: request count by
//! outcome, latency histogram, errors by kind, plus an in-progress gauge. It
//! sits inside the timeout stage and outside load shedding, so shed requests
//! are observed through their `Overloaded` result and timed-out or cancelled
//! requests are observed when the timeout stage drops this stage's future.

use std::task::{Context, Poll};

use envelope_core::{ErrorKind, Outcome, SloTier};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info_span, Instrument, Span};

use super::StageFuture;
use crate::error::EnvelopeError;
use crate::observability::{names, SharedSink};
use crate::resilience::Deadline;
use crate::service::classify::normalize_operation;
use crate::service::operation::Request;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that reports request outcomes to a [`MetricsSink`](crate::observability::MetricsSink).
#[derive(Clone)]
pub struct MetricsLayer {
    sink: SharedSink,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

impl std::fmt::Debug for MetricsLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            sink: self.sink.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    sink: SharedSink,
}

impl<S: std::fmt::Debug> std::fmt::Debug for MetricsService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Error = EnvelopeError> + Send,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = EnvelopeError;
    type Future = StageFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let operation = normalize_operation(&req.ctx.operation);
        let tier = req.ctx.tier_or_default();
        let correlation_id = req
            .ctx
            .correlation_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        let span = info_span!(
            "request",
            operation = %operation,
            tier = %tier,
            correlation_id = %correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let recorder = RequestRecorder::start(
            self.sink.clone(),
            operation,
            tier,
            req.ctx.started_at,
            req.ctx.deadline.clone(),
            span.clone(),
        );
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let result = fut.await;
                recorder.finish(Outcome::from(&result));
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// RequestRecorder
// ---------------------------------------------------------------------------

/// Reports one request's metrics exactly once: on completion, or on drop if
/// the request never completed.
struct RequestRecorder {
    sink: SharedSink,
    operation: String,
    tier: SloTier,
    started_at: Instant,
    deadline: Option<Deadline>,
    span: Span,
    recorded: bool,
}

impl RequestRecorder {
    fn start(
        sink: SharedSink,
        operation: String,
        tier: SloTier,
        started_at: Instant,
        deadline: Option<Deadline>,
        span: Span,
    ) -> Self {
        sink.adjust_gauge(
            names::REQUESTS_IN_PROGRESS,
            &[("operation", operation.clone())],
            1.0,
        );
        Self {
            sink,
            operation,
            tier,
            started_at,
            deadline,
            span,
            recorded: false,
        }
    }

    fn finish(mut self, outcome: Outcome) {
        self.record(outcome);
    }

    fn record(&mut self, outcome: Outcome) {
        if self.recorded {
            return;
        }
        self.recorded = true;

        let elapsed = self.started_at.elapsed();
        let operation = self.operation.clone();
        let tier = self.tier.as_label().to_string();

        self.sink.increment_counter(
            names::REQUESTS_TOTAL,
            &[
                ("operation", operation.clone()),
                ("tier", tier.clone()),
                ("outcome", outcome.as_label().to_string()),
            ],
            1,
        );
        self.sink.record_histogram(
            names::REQUEST_DURATION_SECONDS,
            &[("operation", operation.clone()), ("tier", tier)],
            elapsed.as_secs_f64(),
        );
        if let Outcome::Failure(kind) = outcome {
            self.sink.increment_counter(
                names::ERRORS_TOTAL,
                &[
                    ("operation", operation.clone()),
                    ("kind", kind.as_label().to_string()),
                ],
                1,
            );
        }
        self.sink
            .adjust_gauge(names::REQUESTS_IN_PROGRESS, &[("operation", operation)], -1.0);

        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.span.record("duration_ms", duration_ms);
        self.span.record("outcome", outcome.as_label());
        if outcome.is_success() {
            tracing::info!(parent: &self.span, duration_ms, outcome = outcome.as_label(), "request complete");
        } else {
            tracing::warn!(parent: &self.span, duration_ms, outcome = outcome.as_label(), "request failed");
        }
    }

    /// Why a request that never produced a result ended.
    fn abandoned_kind(&self) -> ErrorKind {
        match &self.deadline {
            Some(deadline) if deadline.is_expired() => ErrorKind::Timeout,
            _ => ErrorKind::Cancelled,
        }
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        if !self.recorded {
            let kind = self.abandoned_kind();
            self.record(Outcome::Failure(kind));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
