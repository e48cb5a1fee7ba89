//! Logging and metrics plumbing.
//!
//! - [`sink`]: the [`MetricsSink`] boundary and its implementations
//! - [`logging`]: `tracing` subscriber installation

pub mod logging;
pub mod sink;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

pub use logging::{init_tracing, LogFormat, LoggingError};
pub use sink::{names, InMemorySink, Label, MetricsSink, NoopSink, RecorderSink, SharedSink};

/// Histogram buckets (seconds) for every `*_duration_seconds` metric.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Installs a Prometheus recorder as the global `metrics` recorder.
///
/// The returned handle renders the exposition text for a `/metrics` endpoint.
///
/// # Errors
///
/// Returns [`BuildError`] if the bucket configuration is rejected or a global
/// recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &LATENCY_BUCKETS,
        )?
        .install_recorder()
}
