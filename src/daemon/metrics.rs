//! Prometheus metrics for the mirror
//!
//! Exposed by the webhook server at `GET /metrics`.

use crate::sync::SyncReport;
use crate::MirrorError;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Histogram: sync run duration per calendar pair (seconds)
    pub static ref SYNC_DURATION: HistogramVec = register_histogram_vec!(
        "calmirror_sync_duration_seconds",
        "Duration of sync runs",
        &["source", "target"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to create sync_duration metric");

    /// Counter: reconciled events by action
    pub static ref SYNC_ACTIONS: CounterVec = register_counter_vec!(
        "calmirror_sync_actions_total",
        "Reconciled events by action",
        &["action"]
    )
    .expect("Failed to create sync_actions metric");

    /// Counter: sync runs by status
    pub static ref SYNC_RUNS: CounterVec = register_counter_vec!(
        "calmirror_sync_runs_total",
        "Sync runs by status",
        &["status"]
    )
    .expect("Failed to create sync_runs metric");

    /// Counter: full syncs by reason (initial or invalidated)
    pub static ref FULL_SYNCS: CounterVec = register_counter_vec!(
        "calmirror_full_syncs_total",
        "Full syncs by reason",
        &["reason"]
    )
    .expect("Failed to create full_syncs metric");

    /// Counter: errors by class and operation
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "calmirror_errors_total",
        "Errors by class and operation",
        &["kind", "operation"]
    )
    .expect("Failed to create errors metric");

    /// Counter: subscription renewals by status
    pub static ref RENEWALS: CounterVec = register_counter_vec!(
        "calmirror_subscription_renewals_total",
        "Subscription renewals by status",
        &["status"]
    )
    .expect("Failed to create renewals metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "calmirror_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record a completed sync run
pub fn record_sync(report: &SyncReport) {
    SYNC_DURATION
        .with_label_values(&[report.source.as_str(), report.target.as_str()])
        .observe(report.elapsed.as_secs_f64());
    for (action, count) in report.action_counts() {
        if count > 0 {
            SYNC_ACTIONS
                .with_label_values(&[action.as_str()])
                .inc_by(count as f64);
        }
    }
    if report.resynced {
        FULL_SYNCS.with_label_values(&["invalidated"]).inc();
    } else if report.full_sync {
        FULL_SYNCS.with_label_values(&["initial"]).inc();
    }
    SYNC_RUNS.with_label_values(&["success"]).inc();
}

/// Record a failed operation
pub fn record_error(operation: &str, error: &MirrorError) {
    ERRORS.with_label_values(&[error.kind(), operation]).inc();
    if operation == "sync" {
        SYNC_RUNS.with_label_values(&["failure"]).inc();
    }
}

pub fn record_renewal(success: bool) {
    RENEWALS
        .with_label_values(&[if success { "success" } else { "failure" }])
        .inc();
}

pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
