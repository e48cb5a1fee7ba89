//! Mapping of pipeline results onto HTTP responses.

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::service::operation::{Failure, Reply};

/// Header carrying the correlation id, inbound and outbound.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// JSON body of every failure response.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    /// Error kind label (`overloaded`, `timeout`, ...).
    pub error: &'static str,
    pub message: String,
    pub request_id: &'a str,
}

/// `Retry-After` value: whole seconds, rounded up.
#[must_use]
pub fn retry_after_secs(after: Duration) -> u64 {
    after.as_secs() + u64::from(after.subsec_nanos() > 0)
}

fn set_request_id(response: &mut Response, id: &str) {
    if let Ok(value) = HeaderValue::from_str(id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error.kind().as_label(),
            message: self.error.to_string(),
            request_id: self.correlation_id.as_str(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(after) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(after)));
        }
        set_request_id(&mut response, self.correlation_id.as_str());
        response
    }
}

impl<R: Serialize> IntoResponse for Reply<R> {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::OK,
            Json(serde_json::json!({
                "request_id": self.correlation_id.as_str(),
                "result": self.body,
            })),
        )
            .into_response();
        set_request_id(&mut response, self.correlation_id.as_str());
        response
    }
}
