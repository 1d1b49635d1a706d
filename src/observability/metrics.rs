//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `job_operator_reconciliations_total` - Total number of reconciliations
//! - `job_operator_reconciliation_errors_total` - Reconciliation errors by class
//! - `job_operator_reconciliation_duration_seconds` - Duration of reconciliations
//! - `job_operator_requeues_total` - Requeues by reason
//! - `job_operator_workloads_created_total` - Workloads created
//! - `job_operator_workloads_deleted_total` - Workloads deleted by reason
//! - `job_operator_phase_transitions_total` - JobRequest phase transitions by target phase
//! - `job_operator_reconciliations_in_flight` - Reconciliations currently running

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "job_operator_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "job_operator_reconciliation_errors_total",
            "Total number of reconciliation errors by class",
        ),
        &["class"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "job_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("job_operator_requeues_total", "Requeues by reason"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static WORKLOADS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "job_operator_workloads_created_total",
        "Total number of workloads created",
    )
    .expect("Failed to create WORKLOADS_CREATED_TOTAL metric - this should never happen")
});

static WORKLOADS_DELETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "job_operator_workloads_deleted_total",
            "Total number of workload deletions by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create WORKLOADS_DELETED_TOTAL metric - this should never happen")
});

static PHASE_TRANSITIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "job_operator_phase_transitions_total",
            "JobRequest phase transitions by target phase",
        ),
        &["phase"],
    )
    .expect("Failed to create PHASE_TRANSITIONS_TOTAL metric - this should never happen")
});

static RECONCILIATIONS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "job_operator_reconciliations_in_flight",
        "Reconciliations currently running",
    )
    .expect("Failed to create RECONCILIATIONS_IN_FLIGHT metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKLOADS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKLOADS_DELETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PHASE_TRANSITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATIONS_IN_FLIGHT.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(class: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[class]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_workloads_created() {
    WORKLOADS_CREATED_TOTAL.inc();
}

pub fn increment_workloads_deleted(reason: &str) {
    WORKLOADS_DELETED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_phase_transitions(phase: &str) {
    PHASE_TRANSITIONS_TOTAL.with_label_values(&[phase]).inc();
}

pub fn reconciliation_started() {
    RECONCILIATIONS_IN_FLIGHT.inc();
}

pub fn reconciliation_finished() {
    RECONCILIATIONS_IN_FLIGHT.dec();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_without_registration() {
        let before = WORKLOADS_DELETED_TOTAL.with_label_values(&["ttl"]).get();
        increment_workloads_deleted("ttl");
        assert_eq!(
            WORKLOADS_DELETED_TOTAL.with_label_values(&["ttl"]).get(),
            before + 1
        );
        let in_flight = RECONCILIATIONS_IN_FLIGHT.get();
        reconciliation_started();
        reconciliation_finished();
        assert_eq!(RECONCILIATIONS_IN_FLIGHT.get(), in_flight);
    }
}
