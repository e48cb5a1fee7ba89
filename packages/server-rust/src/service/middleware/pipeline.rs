//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::classify::{ClassifyLayer, ClassifyService};
use super::correlation::{CorrelationLayer, CorrelationService};
use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::service::envelope::Envelope;

/// The full request pipeline around a handler `S`.
pub type Pipeline<S> =
    CorrelationService<ClassifyService<TimeoutService<MetricsService<LoadShedService<S>>>>>;

/// Wraps `handler` with every envelope stage.
///
/// Layer order (outermost to innermost):
/// 1. `CorrelationLayer` -- every result carries a correlation id
/// 2. `ClassifyLayer` -- SLO tier from the operation name
/// 3. `TimeoutLayer` -- tier deadline, enforced over everything below
/// 4. `MetricsLayer` -- observes every outcome, including shed and timed-out requests
/// 5. `LoadShedLayer` -- reject when overloaded before the handler does any work
///
/// The returned service implements `tower::Service<Request<B>>` whenever
/// `handler` implements it with `Error = EnvelopeError`.
#[must_use]
pub fn build_pipeline<S>(handler: S, envelope: &Envelope) -> Pipeline<S> {
    ServiceBuilder::new()
        .layer(CorrelationLayer)
        .layer(ClassifyLayer::new(Arc::clone(envelope.classifier())))
        .layer(TimeoutLayer::new(
            Arc::clone(envelope.classifier()),
            envelope.default_timeout(),
        ))
        .layer(MetricsLayer::new(Arc::clone(envelope.sink())))
        .layer(LoadShedLayer::new(
            Arc::clone(envelope.shedder()),
            Arc::clone(envelope.sink()),
        ))
        .service(handler)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
