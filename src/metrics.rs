//! Prometheus metrics for batch execution
//!
//! Counters and gauges are registered once in the default registry and
//! exported in text format through [`export_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::batch::ExecutionStatus;

lazy_static! {
    /// Batches reaching a final status
    static ref BATCHES_FINISHED: IntCounterVec = register_int_counter_vec!(
        "autotest_batches_finished_total",
        "Total number of batches that reached a final status",
        &["status"]
    ).expect("batch counter registers once");

    /// Items reaching a final status
    static ref ITEMS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "autotest_items_finished_total",
        "Total number of job items that reached a final status",
        &["status"]
    ).expect("item counter registers once");

    /// Items currently holding a worker slot
    static ref ACTIVE_ITEMS: IntGauge = register_int_gauge!(
        "autotest_active_items",
        "Number of job items currently executing"
    ).expect("active gauge registers once");

    /// Runner-reported item duration
    static ref ITEM_DURATION: Histogram = register_histogram!(
        "autotest_item_duration_seconds",
        "Job item execution duration in seconds",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).expect("duration histogram registers once");

    /// Credential pool outcomes
    static ref CREDENTIAL_ACQUISITIONS: IntCounterVec = register_int_counter_vec!(
        "autotest_credential_acquisitions_total",
        "Credential pool acquisitions by outcome",
        &["outcome"]
    ).expect("credential counter registers once");

    /// Subscribers dropped after a failed send
    static ref PRUNED_SUBSCRIBERS: IntCounterVec = register_int_counter_vec!(
        "autotest_pruned_subscribers_total",
        "Progress subscribers removed after a failed delivery",
        &["reason"]
    ).expect("subscriber counter registers once");
}

/// Record a batch reaching its final status
pub fn record_batch_finished(status: ExecutionStatus) {
    BATCHES_FINISHED.with_label_values(&[status.as_str()]).inc();
}

/// Record an item taking a worker slot
pub fn record_item_started() {
    ACTIVE_ITEMS.inc();
}

/// Record an item releasing its worker slot with a final status
pub fn record_item_finished(status: ExecutionStatus, duration_seconds: Option<f64>) {
    ACTIVE_ITEMS.dec();
    ITEMS_FINISHED.with_label_values(&[status.as_str()]).inc();
    if let Some(duration) = duration_seconds {
        ITEM_DURATION.observe(duration);
    }
}

/// Record an item that was cancelled without ever running
pub fn record_item_skipped() {
    ITEMS_FINISHED
        .with_label_values(&[ExecutionStatus::Cancelled.as_str()])
        .inc();
}

pub fn record_credential_acquisition(granted: bool) {
    let outcome = if granted { "granted" } else { "exhausted" };
    CREDENTIAL_ACQUISITIONS.with_label_values(&[outcome]).inc();
}

pub fn record_subscriber_pruned(reason: &str) {
    PRUNED_SUBSCRIBERS.with_label_values(&[reason]).inc();
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer)
        .map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e).into())
}
