//! Envelope configuration.
//!
//! Every option is a command-line flag that falls back to an environment
//! variable, then to the default. Configuration is validated once at startup
//! and converted into the immutable policy types; nothing is read per call.

use std::time::Duration;

use clap::builder::BoolishValueParser;
use envelope_core::{
    BreakerConfig, BreakerConfigError, PolicyError, RetryPolicy, SloError, SloTable, SloTargets,
    SloTier,
};

use crate::observability::LogFormat;
use crate::resilience::LoadShedder;
use crate::service::classify::SloClassifier;

/// Errors from validating an [`EnvelopeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid retry policy: {0}")]
    Retry(#[from] PolicyError),
    #[error("invalid circuit breaker config: {0}")]
    Breaker(#[from] BreakerConfigError),
    #[error("invalid SLO targets: {0}")]
    Slo(#[from] SloError),
    #[error("LOAD_SHEDDING_MAX_CONCURRENT must be >= 1")]
    ZeroConcurrency,
    #[error("HTTP_TIMEOUT must be non-zero")]
    ZeroTimeout,
}

/// Parses `250ms`, `2s`, `5m`, `1h`, or a bare number of seconds (`1.5`).
///
/// # Errors
///
/// Returns a message naming the rejected input.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1_000.0,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        other => return Err(format!("unknown duration unit {other:?} in {raw:?}")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {raw:?}: {e}"))
}

// ---------------------------------------------------------------------------
// EnvelopeConfig
// ---------------------------------------------------------------------------

/// Configuration for the whole envelope.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "envelope", about = "Service quality envelope", long_about = None)]
pub struct EnvelopeConfig {
    /// Total attempts per protected call, including the first.
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_MULTIPLIER", default_value_t = 2.0)]
    pub retry_multiplier: f64,

    /// Backoff before the first retry.
    #[arg(long, env = "RETRY_MIN_WAIT", default_value = "1s", value_parser = parse_duration)]
    pub retry_min_wait: Duration,

    /// Backoff ceiling.
    #[arg(long, env = "RETRY_MAX_WAIT", default_value = "10s", value_parser = parse_duration)]
    pub retry_max_wait: Duration,

    #[arg(
        long,
        env = "RETRY_JITTER",
        default_value = "true",
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub retry_jitter: bool,

    #[arg(long, env = "CIRCUIT_BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    pub circuit_breaker_failure_threshold: u32,

    #[arg(
        long,
        env = "CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
        default_value = "60s",
        value_parser = parse_duration
    )]
    pub circuit_breaker_recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close.
    #[arg(long, env = "CIRCUIT_BREAKER_SUCCESS_THRESHOLD", default_value_t = 2)]
    pub circuit_breaker_success_threshold: u32,

    #[arg(long, env = "CIRCUIT_BREAKER_HALF_OPEN_MAX_TRIALS", default_value_t = 1)]
    pub circuit_breaker_half_open_max_trials: u32,

    #[arg(long, env = "LOAD_SHEDDING_MAX_CONCURRENT", default_value_t = 1000)]
    pub load_shedding_max_concurrent: usize,

    /// `Retry-After` hint sent with overload rejections.
    #[arg(
        long,
        env = "LOAD_SHEDDING_RETRY_AFTER",
        default_value = "1s",
        value_parser = parse_duration
    )]
    pub load_shedding_retry_after: Duration,

    /// Default request deadline, and the ceiling for every tier timeout.
    #[arg(long, env = "HTTP_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub http_timeout: Duration,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub slo: SloOverrides,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_multiplier: 2.0,
            retry_min_wait: Duration::from_secs(1),
            retry_max_wait: Duration::from_secs(10),
            retry_jitter: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(60),
            circuit_breaker_success_threshold: 2,
            circuit_breaker_half_open_max_trials: 1,
            load_shedding_max_concurrent: 1000,
            load_shedding_retry_after: Duration::from_secs(1),
            http_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            slo: SloOverrides::default(),
        }
    }
}

impl EnvelopeConfig {
    /// Checks every section and the derived policies.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry_policy()?;
        self.breaker_config()?;
        self.slo_table()?;
        if self.load_shedding_max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`PolicyError`] for out-of-range retry settings.
    pub fn retry_policy(&self) -> Result<RetryPolicy, PolicyError> {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_min_wait,
            self.retry_multiplier,
            self.retry_max_wait,
            self.retry_jitter,
        )
    }

    /// # Errors
    ///
    /// Returns [`BreakerConfigError`] for zero thresholds or timeout.
    pub fn breaker_config(&self) -> Result<BreakerConfig, BreakerConfigError> {
        let config = BreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            recovery_timeout: self.circuit_breaker_recovery_timeout,
            success_threshold: self.circuit_breaker_success_threshold,
            half_open_max_trials: self.circuit_breaker_half_open_max_trials,
        };
        config.validate()?;
        Ok(config)
    }

    /// Default tier targets with the configured overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`SloError`] when an overridden tier is inconsistent.
    pub fn slo_table(&self) -> Result<SloTable, SloError> {
        SloTable::new(
            self.slo.apply(SloTargets::defaults_for(SloTier::Critical)),
            self.slo.apply(SloTargets::defaults_for(SloTier::Default)),
            self.slo.apply(SloTargets::defaults_for(SloTier::NonCritical)),
        )
    }

    /// # Errors
    ///
    /// Returns [`SloError`] when the SLO table is invalid.
    pub fn classifier(&self) -> Result<SloClassifier, SloError> {
        Ok(SloClassifier::new(self.slo_table()?, self.http_timeout))
    }

    #[must_use]
    pub fn load_shedder(&self) -> LoadShedder {
        LoadShedder::new(
            self.load_shedding_max_concurrent,
            self.load_shedding_retry_after,
        )
    }
}

// ---------------------------------------------------------------------------
// SloOverrides
// ---------------------------------------------------------------------------

/// Per-tier overrides of the default SLO targets. Unset values keep the
/// tier default.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct SloOverrides {
    #[arg(long, env = "SLO_CRITICAL_P50_MS")]
    pub critical_p50_ms: Option<u64>,
    #[arg(long, env = "SLO_CRITICAL_P95_MS")]
    pub critical_p95_ms: Option<u64>,
    #[arg(long, env = "SLO_CRITICAL_P99_MS")]
    pub critical_p99_ms: Option<u64>,
    #[arg(long, env = "SLO_CRITICAL_P999_MS")]
    pub critical_p999_ms: Option<u64>,
    #[arg(long, env = "SLO_CRITICAL_MAX_ERROR_RATE")]
    pub critical_max_error_rate: Option<f64>,
    #[arg(long, env = "SLO_CRITICAL_MIN_AVAILABILITY")]
    pub critical_min_availability: Option<f64>,
    #[arg(long, env = "SLO_CRITICAL_TIMEOUT", value_parser = parse_duration)]
    pub critical_timeout: Option<Duration>,
    #[arg(long, env = "SLO_CRITICAL_WINDOW", value_parser = parse_duration)]
    pub critical_window: Option<Duration>,

    #[arg(long, env = "SLO_DEFAULT_P50_MS")]
    pub default_p50_ms: Option<u64>,
    #[arg(long, env = "SLO_DEFAULT_P95_MS")]
    pub default_p95_ms: Option<u64>,
    #[arg(long, env = "SLO_DEFAULT_P99_MS")]
    pub default_p99_ms: Option<u64>,
    #[arg(long, env = "SLO_DEFAULT_P999_MS")]
    pub default_p999_ms: Option<u64>,
    #[arg(long, env = "SLO_DEFAULT_MAX_ERROR_RATE")]
    pub default_max_error_rate: Option<f64>,
    #[arg(long, env = "SLO_DEFAULT_MIN_AVAILABILITY")]
    pub default_min_availability: Option<f64>,
    #[arg(long, env = "SLO_DEFAULT_TIMEOUT", value_parser = parse_duration)]
    pub default_timeout: Option<Duration>,
    #[arg(long, env = "SLO_DEFAULT_WINDOW", value_parser = parse_duration)]
    pub default_window: Option<Duration>,

    #[arg(long, env = "SLO_NONCRITICAL_P50_MS")]
    pub noncritical_p50_ms: Option<u64>,
    #[arg(long, env = "SLO_NONCRITICAL_P95_MS")]
    pub noncritical_p95_ms: Option<u64>,
    #[arg(long, env = "SLO_NONCRITICAL_P99_MS")]
    pub noncritical_p99_ms: Option<u64>,
    #[arg(long, env = "SLO_NONCRITICAL_P999_MS")]
    pub noncritical_p999_ms: Option<u64>,
    #[arg(long, env = "SLO_NONCRITICAL_MAX_ERROR_RATE")]
    pub noncritical_max_error_rate: Option<f64>,
    #[arg(long, env = "SLO_NONCRITICAL_MIN_AVAILABILITY")]
    pub noncritical_min_availability: Option<f64>,
    #[arg(long, env = "SLO_NONCRITICAL_TIMEOUT", value_parser = parse_duration)]
    pub noncritical_timeout: Option<Duration>,
    #[arg(long, env = "SLO_NONCRITICAL_WINDOW", value_parser = parse_duration)]
    pub noncritical_window: Option<Duration>,
}

/// One tier's slice of [`SloOverrides`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct TierOverride {
    p50_ms: Option<u64>,
    p95_ms: Option<u64>,
    p99_ms: Option<u64>,
    p999_ms: Option<u64>,
    max_error_rate: Option<f64>,
    min_availability: Option<f64>,
    timeout: Option<Duration>,
    window: Option<Duration>,
}

impl SloOverrides {
    fn for_tier(&self, tier: SloTier) -> TierOverride {
        match tier {
            SloTier::Critical => TierOverride {
                p50_ms: self.critical_p50_ms,
                p95_ms: self.critical_p95_ms,
                p99_ms: self.critical_p99_ms,
                p999_ms: self.critical_p999_ms,
                max_error_rate: self.critical_max_error_rate,
                min_availability: self.critical_min_availability,
                timeout: self.critical_timeout,
                window: self.critical_window,
            },
            SloTier::Default => TierOverride {
                p50_ms: self.default_p50_ms,
                p95_ms: self.default_p95_ms,
                p99_ms: self.default_p99_ms,
                p999_ms: self.default_p999_ms,
                max_error_rate: self.default_max_error_rate,
                min_availability: self.default_min_availability,
                timeout: self.default_timeout,
                window: self.default_window,
            },
            SloTier::NonCritical => TierOverride {
                p50_ms: self.noncritical_p50_ms,
                p95_ms: self.noncritical_p95_ms,
                p99_ms: self.noncritical_p99_ms,
                p999_ms: self.noncritical_p999_ms,
                max_error_rate: self.noncritical_max_error_rate,
                min_availability: self.noncritical_min_availability,
                timeout: self.noncritical_timeout,
                window: self.noncritical_window,
            },
        }
    }

    /// Applies this tier's overrides on top of `targets`.
    #[must_use]
    pub fn apply(&self, mut targets: SloTargets) -> SloTargets {
        let o = self.for_tier(targets.tier);
        let latency = &mut targets.latency;
        if let Some(ms) = o.p50_ms {
            latency.p50 = Duration::from_millis(ms);
        }
        if let Some(ms) = o.p95_ms {
            latency.p95 = Duration::from_millis(ms);
        }
        if let Some(ms) = o.p99_ms {
            latency.p99 = Duration::from_millis(ms);
        }
        if let Some(ms) = o.p999_ms {
            latency.p999 = Duration::from_millis(ms);
        }
        if let Some(rate) = o.max_error_rate {
            targets.max_error_rate = rate;
        }
        if let Some(availability) = o.min_availability {
            targets.min_availability = availability;
        }
        if let Some(window) = o.window {
            targets.window = window;
        }
        if o.timeout.is_some() {
            targets.timeout_override = o.timeout;
        }
        targets
    }
}
