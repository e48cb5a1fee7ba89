//! Tower layers for the request pipeline, one per stage.
//!
//! Outermost first:
//!
//! - [`correlation`]: assigns the correlation id, wraps the result in
//!   [`Reply`](crate::service::Reply) / [`Failure`](crate::service::Failure)
//! - [`classify`]: assigns the SLO tier
//! - [`timeout`]: fixes the request deadline and enforces it
//! - [`metrics`]: RED metrics and the request span
//! - [`load_shed`]: admission control
//! - [`pipeline`]: composes all layers around a handler

pub mod classify;
pub mod correlation;
pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

use std::future::Future;
use std::pin::Pin;

use crate::error::EnvelopeError;

pub use classify::ClassifyLayer;
pub use correlation::CorrelationLayer;
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_pipeline, Pipeline};
pub use timeout::TimeoutLayer;

/// Boxed future returned by the inner stages.
pub type StageFuture<T> = Pin<Box<dyn Future<Output = Result<T, EnvelopeError>> + Send>>;
