//! Service level objectives grouped into three reliability tiers.
//!
//! Each tier carries latency percentile targets, error-rate and availability
//! objectives, a throughput envelope and an evaluation window. Tiers are static
//! configuration: they are validated once when the [`SloTable`] is built and are
//! read-only afterwards.
//!
//! [`SloTargets::timeout`] derives a tier timeout from its p99.9 latency
//! target (`p999 * TIMEOUT_HEADROOM`) unless explicitly overridden, and caps
//! it by the global request timeout.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Multiplier applied to the p99.9 latency target to derive a tier timeout.
pub const TIMEOUT_HEADROOM: u32 = 4;

/// Reliability tier of a logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloTier {
    Critical,
    Default,
    NonCritical,
}

impl SloTier {
    pub const ALL: [SloTier; 3] = [SloTier::Critical, SloTier::Default, SloTier::NonCritical];

    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            SloTier::Critical => "critical",
            SloTier::Default => "default",
            SloTier::NonCritical => "non_critical",
        }
    }
}

impl fmt::Display for SloTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Errors from validating SLO targets.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SloError {
    #[error("{tier}: latency percentiles must be ascending (p50 <= p95 <= p99 <= p999)")]
    PercentileOrder { tier: SloTier },
    #[error("{tier}: {field} must be within [0.0, 1.0], got {value}")]
    RateOutOfRange {
        tier: SloTier,
        field: &'static str,
        value: f64,
    },
    #[error("{tier}: throughput floor {min} exceeds ceiling {max}")]
    Throughput { tier: SloTier, min: f64, max: f64 },
    #[error("{tier}: {field} must be non-zero")]
    ZeroDuration { tier: SloTier, field: &'static str },
}

/// Latency percentile targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyTargets {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
}

impl LatencyTargets {
    #[must_use]
    pub fn from_millis(p50: u64, p95: u64, p99: u64, p999: u64) -> Self {
        Self {
            p50: Duration::from_millis(p50),
            p95: Duration::from_millis(p95),
            p99: Duration::from_millis(p99),
            p999: Duration::from_millis(p999),
        }
    }

    #[must_use]
    pub fn is_ascending(&self) -> bool {
        self.p50 <= self.p95 && self.p95 <= self.p99 && self.p99 <= self.p999
    }
}

/// Objectives for a single tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloTargets {
    pub tier: SloTier,
    pub name: String,
    pub description: String,
    pub latency: LatencyTargets,
    /// Maximum fraction of requests that may fail (0.0..=1.0).
    pub max_error_rate: f64,
    /// Maximum fraction of requests that may fail with a server-side error.
    pub max_5xx_rate: f64,
    /// Minimum fraction of time the service is available (0.0..=1.0).
    pub min_availability: f64,
    pub min_rps: f64,
    pub max_rps: f64,
    /// Evaluation window for the objectives and the error budget.
    pub window: Duration,
    /// Explicit timeout; `None` derives it from the latency targets.
    pub timeout_override: Option<Duration>,
}

impl SloTargets {
    /// Default objectives for `tier`.
    #[must_use]
    pub fn defaults_for(tier: SloTier) -> Self {
        match tier {
            SloTier::Critical => Self {
                tier,
                name: "critical-endpoints".to_string(),
                description: "SLO for critical endpoints (auth, payments, etc.)".to_string(),
                latency: LatencyTargets::from_millis(20, 100, 200, 500),
                max_error_rate: 0.001,
                max_5xx_rate: 0.0001,
                min_availability: 0.9999,
                min_rps: 50.0,
                max_rps: 5_000.0,
                window: Duration::from_secs(60),
                timeout_override: None,
            },
            SloTier::Default => Self {
                tier,
                name: "default".to_string(),
                description: "Service-wide default objective".to_string(),
                latency: LatencyTargets::from_millis(50, 200, 500, 1_000),
                max_error_rate: 0.01,
                max_5xx_rate: 0.001,
                min_availability: 0.999,
                min_rps: 100.0,
                max_rps: 10_000.0,
                window: Duration::from_secs(5 * 60),
                timeout_override: None,
            },
            SloTier::NonCritical => Self {
                tier,
                name: "non-critical-endpoints".to_string(),
                description: "SLO for non-critical endpoints (analytics, reporting, etc.)"
                    .to_string(),
                latency: LatencyTargets::from_millis(100, 500, 2_000, 5_000),
                max_error_rate: 0.05,
                max_5xx_rate: 0.01,
                min_availability: 0.99,
                min_rps: 10.0,
                max_rps: 1_000.0,
                window: Duration::from_secs(60 * 60),
                timeout_override: None,
            },
        }
    }

    /// Checks every target against its valid range.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), SloError> {
        let tier = self.tier;
        if !self.latency.is_ascending() {
            return Err(SloError::PercentileOrder { tier });
        }
        for (field, value) in [
            ("max_error_rate", self.max_error_rate),
            ("max_5xx_rate", self.max_5xx_rate),
            ("min_availability", self.min_availability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SloError::RateOutOfRange { tier, field, value });
            }
        }
        if self.min_rps < 0.0 || self.max_rps < 0.0 || self.min_rps > self.max_rps {
            return Err(SloError::Throughput {
                tier,
                min: self.min_rps,
                max: self.max_rps,
            });
        }
        if self.window.is_zero() {
            return Err(SloError::ZeroDuration { tier, field: "window" });
        }
        if self.timeout_override.is_some_and(|t| t.is_zero()) {
            return Err(SloError::ZeroDuration { tier, field: "timeout" });
        }
        Ok(())
    }

    /// Request timeout for this tier, never exceeding `ceiling`.
    #[must_use]
    pub fn timeout(&self, ceiling: Duration) -> Duration {
        self.timeout_override
            .unwrap_or(self.latency.p999 * TIMEOUT_HEADROOM)
            .min(ceiling)
    }

    /// Allowed downtime within the evaluation window:
    /// `(1 - min_availability) * window`.
    #[must_use]
    pub fn error_budget(&self) -> Duration {
        self.error_budget_over(self.window)
    }

    /// Allowed downtime within an arbitrary window.
    #[must_use]
    pub fn error_budget_over(&self, window: Duration) -> Duration {
        let fraction = (1.0 - self.min_availability).clamp(0.0, 1.0);
        window.mul_f64(fraction)
    }
}

impl fmt::Display for SloTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SLO: {} ({})", self.name, self.tier)?;
        writeln!(f, "Description: {}", self.description)?;
        writeln!(f, "Evaluation Window: {}s", self.window.as_secs())?;
        writeln!(f, "Latency Targets:")?;
        writeln!(f, "  P50:   {}ms", self.latency.p50.as_millis())?;
        writeln!(f, "  P95:   {}ms", self.latency.p95.as_millis())?;
        writeln!(f, "  P99:   {}ms", self.latency.p99.as_millis())?;
        writeln!(f, "  P999:  {}ms", self.latency.p999.as_millis())?;
        writeln!(f, "Error Rate Targets:")?;
        writeln!(f, "  Max Error Rate: {:.2}%", self.max_error_rate * 100.0)?;
        writeln!(f, "  Max 5xx Rate:   {:.2}%", self.max_5xx_rate * 100.0)?;
        writeln!(f, "Throughput Targets:")?;
        writeln!(f, "  Min RPS: {}", self.min_rps)?;
        writeln!(f, "  Max RPS: {}", self.max_rps)?;
        writeln!(f, "Availability Target:")?;
        writeln!(f, "  Min Availability: {:.2}%", self.min_availability * 100.0)?;
        write!(f, "  Error Budget: {:.3}s", self.error_budget().as_secs_f64())
    }
}

/// Validated targets for all three tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloTable {
    critical: SloTargets,
    default: SloTargets,
    non_critical: SloTargets,
}

impl SloTable {
    /// Builds a table, validating every tier.
    ///
    /// # Errors
    ///
    /// Returns [`SloError`] for the first invalid tier.
    pub fn new(
        critical: SloTargets,
        default: SloTargets,
        non_critical: SloTargets,
    ) -> Result<Self, SloError> {
        let table = Self {
            critical: SloTargets {
                tier: SloTier::Critical,
                ..critical
            },
            default: SloTargets {
                tier: SloTier::Default,
                ..default
            },
            non_critical: SloTargets {
                tier: SloTier::NonCritical,
                ..non_critical
            },
        };
        for tier in SloTier::ALL {
            table.get(tier).validate()?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn get(&self, tier: SloTier) -> &SloTargets {
        match tier {
            SloTier::Critical => &self.critical,
            SloTier::Default => &self.default,
            SloTier::NonCritical => &self.non_critical,
        }
    }
}

impl Default for SloTable {
    fn default() -> Self {
        Self {
            critical: SloTargets::defaults_for(SloTier::Critical),
            default: SloTargets::defaults_for(SloTier::Default),
            non_critical: SloTargets::defaults_for(SloTier::NonCritical),
        }
    }
}
