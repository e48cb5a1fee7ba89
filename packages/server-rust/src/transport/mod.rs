//! HTTP surface for the envelope.
//!
//! - [`response`]: failure-to-HTTP mapping (status, `Retry-After`,
//!   `X-Request-Id`, JSON body)
//! - [`handlers`]: demo operation, breaker status, SLO summary and metrics
//!   endpoints

pub mod handlers;
pub mod response;

pub use handlers::{SimulatedFailure, SimulatedWork, BACKEND};
pub use response::{retry_after_secs, ErrorBody, REQUEST_ID_HEADER};

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::service::Envelope;
use handlers::{breakers_handler, liveness_handler, metrics_handler, operation_handler, slo_handler};

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone, Debug)]
pub struct AppState {
    pub envelope: Envelope,
    /// Renders `/metrics`; `None` when no Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Assembles the axum router.
///
/// Routes:
/// - `GET|POST /ops/{name}` -- simulated operation through the full pipeline
/// - `GET /breakers` -- circuit breaker status JSON
/// - `GET /slo` -- SLO targets per tier
/// - `GET /metrics` -- Prometheus exposition
/// - `GET /health/live` -- liveness probe
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ops/{name}", get(operation_handler).post(operation_handler))
        .route("/breakers", get(breakers_handler))
        .route("/slo", get(slo_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health/live", get(liveness_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::EnvelopeConfig;
    use crate::observability::InMemorySink;

    fn router() -> Router {
        let config = EnvelopeConfig {
            retry_jitter: false,
            ..EnvelopeConfig::default()
        };
        let envelope = Envelope::from_config(&config, Arc::new(InMemorySink::new())).unwrap();
        build_router(AppState {
            envelope,
            metrics: None,
        })
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn operation_succeeds_and_echoes_request_id() {
        let req = HttpRequest::builder()
            .uri("/ops/payments?latency_ms=5")
            .header(REQUEST_ID_HEADER, "trace-1")
            .body(Body::empty())
            .unwrap();
        let response = router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-1");

        let body = json_body(response).await;
        assert_eq!(body["request_id"], "trace-1");
        assert_eq!(body["result"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_400_with_generated_id() {
        let response = router()
            .oneshot(get("/ops/orders?fail=permanent"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let id = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();

        let body = json_body(response).await;
        assert_eq!(body["error"], "permanent");
        assert_eq!(body["request_id"], id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn breakers_endpoint_lists_used_dependencies() {
        let app = router();
        let response = app.clone().oneshot(get("/ops/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/breakers")).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body[0]["name"], BACKEND);
        assert_eq!(body[0]["state"], "closed");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let response = router().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn slo_summary_lists_every_tier() {
        let response = router().oneshot(get("/slo")).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("critical-endpoints"));
        assert!(text.contains("non-critical-endpoints"));
        assert!(text.contains("Timeout: 2000ms"));
    }
}
