//! Load-shedding middleware.
//!
//! Rejects requests with `EnvelopeError::Overloaded` when the shared
//! [`LoadShedder`] is at its ceiling. Admitted requests hold an
//! [`AdmissionPermit`](crate::resilience::AdmissionPermit) inside their future,
//! so the slot is released however the future ends.

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::StageFuture;
use crate::error::EnvelopeError;
use crate::observability::{names, SharedSink};
use crate::resilience::LoadShedder;
use crate::service::operation::Request;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that gates requests on a shared [`LoadShedder`].
///
/// Over-limit requests are rejected immediately rather than queued.
#[derive(Clone)]
pub struct LoadShedLayer {
    shedder: Arc<LoadShedder>,
    sink: SharedSink,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(shedder: Arc<LoadShedder>, sink: SharedSink) -> Self {
        Self { shedder, sink }
    }
}

impl std::fmt::Debug for LoadShedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadShedLayer")
            .field("shedder", &self.shedder)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            shedder: Arc::clone(&self.shedder),
            sink: self.sink.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LoadShedService<S> {
    inner: S,
    shedder: Arc<LoadShedder>,
    sink: SharedSink,
}

impl<S: std::fmt::Debug> std::fmt::Debug for LoadShedService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadShedService")
            .field("inner", &self.inner)
            .field("shedder", &self.shedder)
            .finish_non_exhaustive()
    }
}

impl<S, B> Service<Request<B>> for LoadShedService<S>
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
        let permit = match self.shedder.try_admit() {
            Ok(permit) => permit,
            Err(overloaded) => {
                self.sink
                    .increment_counter(names::LOAD_SHED_REJECTIONS_TOTAL, &[], 1);
                tracing::warn!(
                    operation = %req.ctx.operation,
                    in_flight = overloaded.in_flight,
                    limit = overloaded.limit,
                    "shedding load"
                );
                let error: EnvelopeError = overloaded.into();
                return Box::pin(std::future::ready(Err::<S::Response, _>(error)));
            }
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            // Hold the permit for the duration of the request.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
