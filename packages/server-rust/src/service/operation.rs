//! Request and response types that flow through the pipeline.

use std::time::Duration;

use envelope_core::{CorrelationId, SloTier};
use tokio::time::Instant;

use crate::error::EnvelopeError;
use crate::resilience::Deadline;

/// Per-request state, created at pipeline entry and filled in by each stage.
///
/// The correlation stage sets `correlation_id`, classification sets `tier`
/// and the timeout stage sets `deadline`. The request's outcome is carried by
/// the pipeline's `Result`, not stored here.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: Option<CorrelationId>,
    /// Operation name or route path as received.
    pub operation: String,
    pub started_at: Instant,
    pub tier: Option<SloTier>,
    pub deadline: Option<Deadline>,
}

impl RequestContext {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            operation: operation.into(),
            started_at: Instant::now(),
            tier: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The assigned tier, or [`SloTier::Default`] before classification.
    #[must_use]
    pub fn tier_or_default(&self) -> SloTier {
        self.tier.unwrap_or(SloTier::Default)
    }
}

/// A request entering the pipeline: context plus an opaque body for the
/// handler.
#[derive(Debug)]
pub struct Request<B> {
    pub ctx: RequestContext,
    pub body: B,
}

impl<B> Request<B> {
    pub fn new(operation: impl Into<String>, body: B) -> Self {
        Self {
            ctx: RequestContext::new(operation),
            body,
        }
    }

    /// Carries a caller-supplied correlation id (e.g. from `X-Request-ID`).
    #[must_use]
    pub fn with_correlation_id(mut self, raw: &str) -> Self {
        self.ctx.correlation_id = Some(CorrelationId::from_caller(raw));
        self
    }

    /// Pins the tier instead of letting the classifier choose.
    #[must_use]
    pub fn with_tier(mut self, tier: SloTier) -> Self {
        self.ctx.tier = Some(tier);
        self
    }
}

/// Successful pipeline result.
#[derive(Debug)]
pub struct Reply<R> {
    pub correlation_id: CorrelationId,
    pub body: R,
}

/// Failed pipeline result. Always carries the correlation id.
#[derive(Debug, thiserror::Error)]
#[error("[{correlation_id}] {error}")]
pub struct Failure {
    pub correlation_id: CorrelationId,
    #[source]
    pub error: EnvelopeError,
}

impl Failure {
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        self.error.status()
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.error.retry_after()
    }
}
