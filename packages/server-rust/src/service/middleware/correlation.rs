//! Correlation-id stage.
//!
//! Keeps an id the caller already supplied, otherwise generates one, and
//! attaches it to the pipeline's result on both the success and the failure
//! path.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use envelope_core::CorrelationId;
use tower::{Layer, Service};

use crate::error::EnvelopeError;
use crate::service::operation::{Failure, Reply, Request};

// ---------------------------------------------------------------------------
// CorrelationLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService { inner }
    }
}

// ---------------------------------------------------------------------------
// CorrelationService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CorrelationService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for CorrelationService<S>
where
    S: Service<Request<B>, Error = EnvelopeError> + Send,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = Reply<S::Response>;
    type Error = Failure;
    type Future = Pin<Box<dyn Future<Output = Result<Reply<S::Response>, Failure>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness failures happen before any id exists; give them one so
        // they are still traceable.
        self.inner.poll_ready(cx).map_err(|error| Failure {
            correlation_id: CorrelationId::generate(),
            error,
        })
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let correlation_id = req
            .ctx
            .correlation_id
            .get_or_insert_with(CorrelationId::generate)
            .clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            match fut.await {
                Ok(body) => Ok(Reply {
                    correlation_id,
                    body,
                }),
                Err(error) => Err(Failure {
                    correlation_id,
                    error,
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
