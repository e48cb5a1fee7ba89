//! SLO classification stage.

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::StageFuture;
use crate::error::EnvelopeError;
use crate::service::classify::SloClassifier;
use crate::service::operation::Request;

// ---------------------------------------------------------------------------
// ClassifyLayer
// ---------------------------------------------------------------------------

/// Assigns each request its tier unless the caller already pinned one.
#[derive(Debug, Clone)]
pub struct ClassifyLayer {
    classifier: Arc<SloClassifier>,
}

impl ClassifyLayer {
    #[must_use]
    pub fn new(classifier: Arc<SloClassifier>) -> Self {
        Self { classifier }
    }
}

impl<S> Layer<S> for ClassifyLayer {
    type Service = ClassifyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClassifyService {
            inner,
            classifier: Arc::clone(&self.classifier),
        }
    }
}

// ---------------------------------------------------------------------------
// ClassifyService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClassifyService<S> {
    inner: S,
    classifier: Arc<SloClassifier>,
}

impl<S, B> Service<Request<B>> for ClassifyService<S>
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
        if req.ctx.tier.is_none() {
            let tier = self.classifier.classify(&req.ctx.operation);
            tracing::trace!(operation = %req.ctx.operation, %tier, "classified request");
            req.ctx.tier = Some(tier);
        }
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
