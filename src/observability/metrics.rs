//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `keychain_reconciliations_total` - Total number of reconcile attempts
//! - `keychain_reconciliation_errors_total` - Attempts that hit the retry path
//! - `keychain_reconciliation_duration_seconds` - Duration of reconcile attempts
//! - `keychain_secrets_created_total` - Managed Secrets created
//! - `keychain_secrets_updated_total` - Managed Secrets updated
//! - `keychain_ownership_conflicts_total` - Reconciles refused on foreign secrets
//! - `keychain_generation_failures_total` - Generator invocations that failed
//! - `keychain_repo_syncs_total` - Keychain poll outcomes, by keychain and result
//! - `keychain_workqueue_depth` - Identities currently awaiting delivery

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keychain_reconciliations_total",
        "Total number of reconcile attempts",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keychain_reconciliation_errors_total",
        "Reconcile attempts that failed with a cluster API error and were requeued",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "keychain_reconciliation_duration_seconds",
            "Duration of reconcile attempts in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static SECRETS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keychain_secrets_created_total",
        "Managed Secrets created from SecretIntent resources",
    )
    .expect("Failed to create SECRETS_CREATED_TOTAL metric - this should never happen")
});

static SECRETS_UPDATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keychain_secrets_updated_total",
        "Managed Secrets updated with fresh generated values",
    )
    .expect("Failed to create SECRETS_UPDATED_TOTAL metric - this should never happen")
});

static OWNERSHIP_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keychain_ownership_conflicts_total",
        "Reconcile attempts refused because the Secret is not owned by the intent",
    )
    .expect("Failed to create OWNERSHIP_CONFLICTS_TOTAL metric - this should never happen")
});

static GENERATION_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keychain_generation_failures_total",
        "Generator invocations that failed",
    )
    .expect("Failed to create GENERATION_FAILURES_TOTAL metric - this should never happen")
});

static REPO_SYNCS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "keychain_repo_syncs_total",
            "Keychain repository poll outcomes",
        ),
        &["keychain", "result"],
    )
    .expect("Failed to create REPO_SYNCS_TOTAL metric - this should never happen")
});

static WORKQUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "keychain_workqueue_depth",
        "Identities currently awaiting delivery on the work queue",
    )
    .expect("Failed to create WORKQUEUE_DEPTH metric - this should never happen")
});

/// Register all metrics with the shared registry. Called once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SECRETS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRETS_UPDATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OWNERSHIP_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GENERATION_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REPO_SYNCS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKQUEUE_DEPTH.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(seconds: f64) {
    RECONCILIATION_DURATION.observe(seconds);
}

pub fn increment_secrets_created() {
    SECRETS_CREATED_TOTAL.inc();
}

pub fn increment_secrets_updated() {
    SECRETS_UPDATED_TOTAL.inc();
}

pub fn increment_ownership_conflicts() {
    OWNERSHIP_CONFLICTS_TOTAL.inc();
}

pub fn increment_generation_failures() {
    GENERATION_FAILURES_TOTAL.inc();
}

/// Record a keychain poll outcome. `result` is one of `changed`,
/// `unchanged`, or `error`.
pub fn increment_repo_syncs(keychain: &str, result: &str) {
    REPO_SYNCS_TOTAL.with_label_values(&[keychain, result]).inc();
}

pub fn set_workqueue_depth(depth: usize) {
    WORKQUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other tests drive the same statics concurrently, so assertions here
    // are monotonic rather than exact.
    #[test]
    fn counters_increment() {
        let before = RECONCILIATIONS_TOTAL.get();
        increment_reconciliations();
        assert!(RECONCILIATIONS_TOTAL.get() > before);
    }

    #[test]
    fn registration_is_single_shot() {
        register_metrics().unwrap();
        assert!(register_metrics().is_err());
    }

    #[test]
    fn repo_sync_labels_are_independent() {
        increment_repo_syncs("standard", "changed");
        increment_repo_syncs("standard", "error");
        let changed = REPO_SYNCS_TOTAL.with_label_values(&["standard", "changed"]);
        assert!(changed.get() >= 1);
    }
}
