//! Timeout middleware.
//!
//! Fixes the request deadline once, from the request's SLO tier (or the
//! default budget when unclassified), stores it in the context for nested
//! stages and handlers, and enforces it with [`enforce`]. On expiry the
//! deadline's token is cancelled and the request fails with
//! `EnvelopeError::Timeout`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use super::StageFuture;
use crate::error::EnvelopeError;
use crate::resilience::{enforce, Deadline};
use crate::service::classify::SloClassifier;
use crate::service::operation::Request;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds everything downstream by the request deadline.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    classifier: Arc<SloClassifier>,
    default_budget: Duration,
}

impl TimeoutLayer {
    /// Tiered requests get the tier timeout; unclassified ones get
    /// `default_budget`.
    #[must_use]
    pub fn new(classifier: Arc<SloClassifier>, default_budget: Duration) -> Self {
        Self {
            classifier,
            default_budget,
        }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            classifier: Arc::clone(&self.classifier),
            default_budget: self.default_budget,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    classifier: Arc<SloClassifier>,
    default_budget: Duration,
}

impl<S, B> Service<Request<B>> for TimeoutService<S>
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

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // A deadline set upstream is never extended.
        let deadline = match req.ctx.deadline.clone() {
            Some(existing) => existing,
            None => {
                let budget = req
                    .ctx
                    .tier
                    .map_or(self.default_budget, |tier| self.classifier.timeout_for(tier));
                Deadline::after(budget)
            }
        };
        req.ctx.deadline = Some(deadline.clone());

        let fut = self.inner.call(req);
        Box::pin(async move {
            match enforce(deadline, move |_| fut).await {
                Ok(result) => result,
                Err(exceeded) => Err(exceeded.into()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use envelope_core::{SloTable, SloTier};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;

    /// Service that takes a configurable delay before responding and reports
    /// the deadline it saw.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Request<()>> for SlowService {
        type Response = Duration;
        type Error = EnvelopeError;
        type Future = StageFuture<Duration>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<()>) -> Self::Future {
            let delay = self.delay_ms;
            let budget = req.ctx.deadline.as_ref().map(Deadline::budget);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                budget.ok_or_else(|| EnvelopeError::Internal(anyhow::anyhow!("no deadline")))
            })
        }
    }

    fn layer() -> TimeoutLayer {
        // Critical 2s, default 3s (capped), non-critical 3s (capped).
        let classifier = SloClassifier::new(SloTable::default(), Duration::from_secs(3));
        TimeoutLayer::new(Arc::new(classifier), Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_tier_budget() {
        let svc = layer().layer(SlowService { delay_ms: 10 });
        let req = Request::new("op", ()).with_tier(SloTier::Critical);
        let budget = svc.oneshot(req).await.unwrap();
        assert_eq!(budget, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_request_uses_default_budget() {
        let svc = layer().layer(SlowService { delay_ms: 600 });
        let err = svc.oneshot(Request::new("op", ())).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Timeout { budget } if budget == Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_deadline_cancels_downstream_token() {
        let token = CancellationToken::new();
        let mut req = Request::new("op", ());
        req.ctx.deadline = Some(Deadline::with_token(Duration::from_millis(50), token.clone()));

        let svc = layer().layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(req).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Timeout { budget } if budget == Duration::from_millis(50)));
        assert!(token.is_cancelled());
    }
}
