//! Metrics sink boundary.
//!
//! Components never talk to a metrics backend directly; they report through
//! [`MetricsSink`]. [`RecorderSink`] forwards to the global `metrics` recorder
//! (Prometheus in production), [`InMemorySink`] keeps values for assertions,
//! and [`NoopSink`] discards everything.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

/// A metric label: static key, dynamic value.
pub type Label = (&'static str, String);

/// Metric names reported by the envelope.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "envelope_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "envelope_request_duration_seconds";
    pub const REQUESTS_IN_PROGRESS: &str = "envelope_requests_in_progress";
    pub const ERRORS_TOTAL: &str = "envelope_errors_total";
    pub const BREAKER_STATE: &str = "envelope_circuit_breaker_state";
    pub const BREAKER_FAILURES_TOTAL: &str = "envelope_circuit_breaker_failures_total";
    pub const BREAKER_REJECTIONS_TOTAL: &str = "envelope_circuit_breaker_rejections_total";
    pub const RETRY_ATTEMPTS_TOTAL: &str = "envelope_retry_attempts_total";
    pub const RETRY_OUTCOMES_TOTAL: &str = "envelope_retry_outcomes_total";
    pub const LOAD_SHED_REJECTIONS_TOTAL: &str = "envelope_load_shed_rejections_total";
}

/// Receiver for counters, histograms and gauges (RED metrics plus breaker
/// state and retry attempts).
pub trait MetricsSink: Send + Sync + 'static {
    fn increment_counter(&self, name: &'static str, labels: &[Label], value: u64);

    /// Records one observation, durations in seconds.
    fn record_histogram(&self, name: &'static str, labels: &[Label], value: f64);

    fn set_gauge(&self, name: &'static str, labels: &[Label], value: f64);

    fn adjust_gauge(&self, name: &'static str, labels: &[Label], delta: f64);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn MetricsSink>;

// ---------------------------------------------------------------------------
// RecorderSink
// ---------------------------------------------------------------------------

/// Forwards to whatever recorder is installed in the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

fn to_labels(labels: &[Label]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new(*k, v.clone()))
        .collect()
}

impl MetricsSink for RecorderSink {
    fn increment_counter(&self, name: &'static str, labels: &[Label], value: u64) {
        metrics::counter!(name, to_labels(labels)).increment(value);
    }

    fn record_histogram(&self, name: &'static str, labels: &[Label], value: f64) {
        metrics::histogram!(name, to_labels(labels)).record(value);
    }

    fn set_gauge(&self, name: &'static str, labels: &[Label], value: f64) {
        metrics::gauge!(name, to_labels(labels)).set(value);
    }

    fn adjust_gauge(&self, name: &'static str, labels: &[Label], delta: f64) {
        metrics::gauge!(name, to_labels(labels)).increment(delta);
    }
}

// ---------------------------------------------------------------------------
// NoopSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment_counter(&self, _name: &'static str, _labels: &[Label], _value: u64) {}
    fn record_histogram(&self, _name: &'static str, _labels: &[Label], _value: f64) {}
    fn set_gauge(&self, _name: &'static str, _labels: &[Label], _value: f64) {}
    fn adjust_gauge(&self, _name: &'static str, _labels: &[Label], _delta: f64) {}
}

// ---------------------------------------------------------------------------
// InMemorySink
// ---------------------------------------------------------------------------

/// Keeps every reported value in memory, keyed by `name{k=v,...}` with labels
/// sorted by key.
#[derive(Debug, Default)]
pub struct InMemorySink {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: &[(&str, &str)]) -> String {
        let mut sorted: Vec<_> = labels.to_vec();
        sorted.sort_unstable_by_key(|(k, _)| *k);
        let mut key = String::from(name);
        key.push('{');
        for (i, (k, v)) in sorted.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            let _ = write!(key, "{k}={v}");
        }
        key.push('}');
        key
    }

    fn owned_key(name: &str, labels: &[Label]) -> String {
        let borrowed: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Self::key(name, &borrowed)
    }

    /// Counter value, zero when never incremented.
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .get(&Self::key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| *v)
            .sum()
    }

    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.lock().get(&Self::key(name, labels)).copied()
    }

    #[must_use]
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        self.histograms
            .lock()
            .get(&Self::key(name, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemorySink {
    fn increment_counter(&self, name: &'static str, labels: &[Label], value: u64) {
        *self
            .counters
            .lock()
            .entry(Self::owned_key(name, labels))
            .or_insert(0) += value;
    }

    fn record_histogram(&self, name: &'static str, labels: &[Label], value: f64) {
        self.histograms
            .lock()
            .entry(Self::owned_key(name, labels))
            .or_default()
            .push(value);
    }

    fn set_gauge(&self, name: &'static str, labels: &[Label], value: f64) {
        self.gauges.lock().insert(Self::owned_key(name, labels), value);
    }

    fn adjust_gauge(&self, name: &'static str, labels: &[Label], delta: f64) {
        *self
            .gauges
            .lock()
            .entry(Self::owned_key(name, labels))
            .or_insert(0.0) += delta;
    }
}
