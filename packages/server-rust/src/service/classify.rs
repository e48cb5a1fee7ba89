//! Operation-to-tier classification.
//!
//! The mapping is built once at startup from a validated [`SloTable`] and is
//! read-only afterwards. Lookup order: exact operation name, critical route
//! patterns, non-critical route patterns, then [`SloTier::Default`].

use std::collections::HashMap;
use std::time::Duration;

use envelope_core::{SloTable, SloTargets, SloTier};
use uuid::Uuid;

/// Route fragments served under the critical tier.
pub const CRITICAL_PATTERNS: &[&str] = &["/health", "/auth", "/login", "/payments", "/transactions"];

/// Route fragments served under the non-critical tier.
pub const NON_CRITICAL_PATTERNS: &[&str] = &["/analytics", "/reports", "/export", "/batch"];

/// Collapses high-cardinality path segments so operation names are safe to
/// use as metric labels: query strings are dropped, UUIDs and numeric ids
/// become `{id}` and a trailing slash is removed.
#[must_use]
pub fn normalize_operation(operation: &str) -> String {
    let path = operation.split(['?', '#']).next().unwrap_or(operation);
    let mut normalized = path
        .split('/')
        .map(|segment| if is_id_segment(segment) { "{id}" } else { segment })
        .collect::<Vec<_>>()
        .join("/");
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    segment.bytes().all(|b| b.is_ascii_digit())
        || (segment.len() == 36 && Uuid::try_parse(segment).is_ok())
}

// ---------------------------------------------------------------------------
// SloClassifier
// ---------------------------------------------------------------------------

/// Maps operation names to SLO tiers and exposes each tier's targets.
#[derive(Debug, Clone)]
pub struct SloClassifier {
    table: SloTable,
    exact: HashMap<String, SloTier>,
    critical_patterns: Vec<String>,
    non_critical_patterns: Vec<String>,
    timeout_ceiling: Duration,
}

impl SloClassifier {
    /// A classifier with the standard route patterns. No tier timeout will
    /// exceed `timeout_ceiling`.
    #[must_use]
    pub fn new(table: SloTable, timeout_ceiling: Duration) -> Self {
        Self {
            table,
            exact: HashMap::new(),
            critical_patterns: CRITICAL_PATTERNS.iter().map(ToString::to_string).collect(),
            non_critical_patterns: NON_CRITICAL_PATTERNS.iter().map(ToString::to_string).collect(),
            timeout_ceiling,
        }
    }

    /// Maps one operation name (normalized) to `tier`, taking precedence over
    /// pattern matches.
    #[must_use]
    pub fn with_operation(mut self, operation: &str, tier: SloTier) -> Self {
        self.exact.insert(normalize_operation(operation), tier);
        self
    }

    /// Adds a substring pattern for `tier`. Patterns for the default tier are
    /// pointless and ignored.
    #[must_use]
    pub fn with_pattern(mut self, pattern: &str, tier: SloTier) -> Self {
        match tier {
            SloTier::Critical => self.critical_patterns.push(pattern.to_string()),
            SloTier::NonCritical => self.non_critical_patterns.push(pattern.to_string()),
            SloTier::Default => {}
        }
        self
    }

    /// The tier for `operation`; [`SloTier::Default`] when nothing matches.
    #[must_use]
    pub fn classify(&self, operation: &str) -> SloTier {
        let normalized = normalize_operation(operation);
        if let Some(tier) = self.exact.get(&normalized) {
            return *tier;
        }
        if self.critical_patterns.iter().any(|p| normalized.contains(p.as_str())) {
            return SloTier::Critical;
        }
        if self.non_critical_patterns.iter().any(|p| normalized.contains(p.as_str())) {
            return SloTier::NonCritical;
        }
        SloTier::Default
    }

    #[must_use]
    pub fn targets(&self, tier: SloTier) -> &SloTargets {
        self.table.get(tier)
    }

    #[must_use]
    pub fn table(&self) -> &SloTable {
        &self.table
    }

    /// Request budget for `tier`, as fed to the timeout stage.
    ///
    /// The default tier runs on the global request timeout unless it has an
    /// explicit override; the other tiers derive theirs from latency targets.
    #[must_use]
    pub fn timeout_for(&self, tier: SloTier) -> Duration {
        let targets = self.targets(tier);
        if tier == SloTier::Default && targets.timeout_override.is_none() {
            return self.timeout_ceiling;
        }
        targets.timeout(self.timeout_ceiling)
    }

    /// Allowed downtime for `tier` over its evaluation window.
    #[must_use]
    pub fn error_budget(&self, tier: SloTier) -> Duration {
        self.targets(tier).error_budget()
    }

    #[must_use]
    pub fn timeout_ceiling(&self) -> Duration {
        self.timeout_ceiling
    }
}

impl Default for SloClassifier {
    fn default() -> Self {
        Self::new(SloTable::default(), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn normalizes_ids_and_query_strings() {
        assert_eq!(normalize_operation("/users/42"), "/users/{id}");
        assert_eq!(normalize_operation("/users/42/orders/7"), "/users/{id}/orders/{id}");
        assert_eq!(normalize_operation("/a/1/2/3"), "/a/{id}/{id}/{id}");
        assert_eq!(
            normalize_operation("/orders/3f2b8c1e-9d4a-4e6f-8a7b-1c2d3e4f5a6b/items"),
            "/orders/{id}/items"
        );
        assert_eq!(normalize_operation("/search/?q=1"), "/search");
        assert_eq!(normalize_operation("/"), "/");
        assert_eq!(normalize_operation("/v2/items"), "/v2/items");
        assert_eq!(normalize_operation("checkout"), "checkout");
    }

    #[test]
    fn route_patterns_pick_tiers() {
        let classifier = SloClassifier::default();
        assert_eq!(classifier.classify("/api/v1/payments/99"), SloTier::Critical);
        assert_eq!(classifier.classify("/health"), SloTier::Critical);
        assert_eq!(classifier.classify("/reports/monthly"), SloTier::NonCritical);
        assert_eq!(classifier.classify("/batch/jobs"), SloTier::NonCritical);
        assert_eq!(classifier.classify("/orders"), SloTier::Default);
        assert_eq!(classifier.classify("unmapped"), SloTier::Default);
    }

    #[test]
    fn exact_mapping_wins_over_patterns() {
        let classifier = SloClassifier::default()
            .with_operation("/health/deep", SloTier::NonCritical)
            .with_operation("checkout", SloTier::Critical);
        assert_eq!(classifier.classify("/health/deep"), SloTier::NonCritical);
        assert_eq!(classifier.classify("/health"), SloTier::Critical);
        assert_eq!(classifier.classify("checkout"), SloTier::Critical);
    }

    #[test]
    fn critical_patterns_are_checked_first() {
        let classifier = SloClassifier::default();
        assert_eq!(classifier.classify("/export/payments"), SloTier::Critical);
    }

    #[test]
    fn custom_patterns_extend_defaults() {
        let classifier = SloClassifier::default()
            .with_pattern("/search", SloTier::NonCritical)
            .with_pattern("/ignored", SloTier::Default);
        assert_eq!(classifier.classify("/search"), SloTier::NonCritical);
        assert_eq!(classifier.classify("/ignored"), SloTier::Default);
    }

    #[test]
    fn tier_timeouts_are_capped_by_ceiling() {
        let classifier = SloClassifier::new(SloTable::default(), Duration::from_secs(3));
        // p999 x 4: 2s and 20s; default tier takes the ceiling.
        assert_eq!(classifier.timeout_for(SloTier::Critical), Duration::from_secs(2));
        assert_eq!(classifier.timeout_for(SloTier::Default), Duration::from_secs(3));
        assert_eq!(classifier.timeout_for(SloTier::NonCritical), Duration::from_secs(3));
    }

    #[test]
    fn default_tier_runs_on_global_timeout_unless_overridden() {
        let classifier = SloClassifier::new(SloTable::default(), Duration::from_secs(30));
        assert_eq!(classifier.timeout_for(SloTier::Default), Duration::from_secs(30));
        assert_eq!(classifier.timeout_for(SloTier::Critical), Duration::from_secs(2));

        let table = SloTable::new(
            SloTargets::defaults_for(SloTier::Critical),
            SloTargets {
                timeout_override: Some(Duration::from_millis(750)),
                ..SloTargets::defaults_for(SloTier::Default)
            },
            SloTargets::defaults_for(SloTier::NonCritical),
        )
        .unwrap();
        let classifier = SloClassifier::new(table, Duration::from_secs(30));
        assert_eq!(classifier.timeout_for(SloTier::Default), Duration::from_millis(750));
    }

    #[test]
    fn error_budget_follows_availability_and_window() {
        let classifier = SloClassifier::default();
        // (1 - 0.999) x 300s
        let budget = classifier.error_budget(SloTier::Default);
        assert!((budget.as_secs_f64() - 0.3).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent_and_strips_numeric_ids(
            segments in proptest::collection::vec("[a-z]{1,6}|[0-9]{1,6}", 0..6),
            trailing in any::<bool>(),
        ) {
            let mut path = format!("/{}", segments.join("/"));
            if trailing {
                path.push('/');
            }
            let once = normalize_operation(&path);
            prop_assert_eq!(normalize_operation(&once), once.clone());
            prop_assert!(once
                .split('/')
                .all(|s| s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit())));
        }
    }
}
