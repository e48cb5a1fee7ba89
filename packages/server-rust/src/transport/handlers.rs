//! HTTP handlers for the demo surface.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use envelope_core::SloTier;
use serde::Deserialize;
use tower::{service_fn, ServiceExt};

use super::response::REQUEST_ID_HEADER;
use super::AppState;
use crate::error::EnvelopeError;
use crate::service::operation::Request;

/// Dependency name used by the simulated operation handler.
pub const BACKEND: &str = "backend";

/// How a simulated backend failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedFailure {
    Transient,
    Permanent,
}

/// Query parameters of `/ops/{name}`: what the backend call should do.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SimulatedWork {
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub fail: Option<SimulatedFailure>,
}

async fn simulate(work: SimulatedWork) -> Result<u64, EnvelopeError> {
    tokio::time::sleep(Duration::from_millis(work.latency_ms)).await;
    match work.fail {
        None => Ok(work.latency_ms),
        Some(SimulatedFailure::Transient) => {
            Err(EnvelopeError::transient("simulated backend failure"))
        }
        Some(SimulatedFailure::Permanent) => {
            Err(EnvelopeError::permanent("simulated invalid request"))
        }
    }
}

/// Runs `/ops/{name}` through the full pipeline. The handler calls the
/// simulated backend through its breaker and retry policy.
pub async fn operation_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(work): Query<SimulatedWork>,
    headers: HeaderMap,
) -> Response {
    let mut req = Request::new(format!("/ops/{name}"), work);
    if let Some(id) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        req = req.with_correlation_id(id);
    }

    let envelope = state.envelope.clone();
    let handler = service_fn(move |req: Request<SimulatedWork>| {
        let envelope = envelope.clone();
        async move {
            let deadline = req.ctx.deadline.clone();
            let work = req.body;
            envelope
                .call_dependency(BACKEND, deadline.as_ref(), || simulate(work))
                .await
        }
    });

    match state.envelope.pipeline(handler).oneshot(req).await {
        Ok(reply) => reply.into_response(),
        Err(failure) => failure.into_response(),
    }
}

/// Status of every circuit breaker, sorted by name.
pub async fn breakers_handler(State(state): State<AppState>) -> Response {
    Json(state.envelope.breakers().snapshot()).into_response()
}

/// Human-readable SLO targets of every tier.
pub async fn slo_handler(State(state): State<AppState>) -> String {
    let classifier = state.envelope.classifier();
    SloTier::ALL
        .iter()
        .map(|tier| {
            format!(
                "{}\n  Timeout: {}ms\n",
                classifier.targets(*tier),
                classifier.timeout_for(*tier).as_millis()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prometheus exposition text; 404 when no recorder is installed.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Liveness probe -- always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}
