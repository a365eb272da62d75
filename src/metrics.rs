//! Prometheus metrics for the bridge relayer
//!
//! Registered in the default registry and served on /metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram, CounterVec,
    Gauge, GaugeVec, Histogram,
};

lazy_static! {
    // Block processing metrics
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "relayer_blocks_processed_total",
        "Total number of blocks scanned",
        &["chain"]
    ).expect("constant metric name is valid");

    pub static ref CHECKPOINT_BLOCK: GaugeVec = register_gauge_vec!(
        "relayer_checkpoint_block",
        "Last block fully processed",
        &["chain"]
    ).expect("constant metric name is valid");

    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_events_observed_total",
        "Bridge events decoded from chain logs",
        &["chain", "kind"]
    ).expect("constant metric name is valid");

    // Transfer pipeline
    pub static ref TRANSFERS_SIGNED: CounterVec = register_counter_vec!(
        "relayer_transfers_signed_total",
        "Attestations produced",
        &["result"]
    ).expect("constant metric name is valid");

    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Completion transactions sent or rejected",
        &["mode", "result"]
    ).expect("constant metric name is valid");

    pub static ref REJECTIONS: CounterVec = register_counter_vec!(
        "relayer_rejections_total",
        "Submission rejections by error class",
        &["class"]
    ).expect("constant metric name is valid");

    pub static ref TRANSFERS_SETTLED: CounterVec = register_counter_vec!(
        "relayer_transfers_settled_total",
        "Transfers recorded as completed or refunded",
        &["status"]
    ).expect("constant metric name is valid");

    // Queue sizes
    pub static ref PENDING_TRANSFERS: Gauge = register_gauge!(
        "relayer_pending_transfers",
        "Transfers still pending at the end of the last tick"
    ).expect("constant metric name is valid");

    pub static ref NEEDS_OPERATOR: Gauge = register_gauge!(
        "relayer_needs_operator_transfers",
        "Pending transfers that stopped auto-retrying"
    ).expect("constant metric name is valid");

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["stage"]
    ).expect("constant metric name is valid");

    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "relayer_tick_duration_seconds",
        "Wall time of one reconciliation tick",
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).expect("constant metric name is valid");

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up (1) or down (0)"
    ).expect("constant metric name is valid");
}

pub fn record_error(stage: &str) {
    ERRORS.with_label_values(&[stage]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered() {
        record_error("poll");
        EVENTS_OBSERVED.with_label_values(&["source", "initiated"]).inc();
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"relayer_errors_total".to_string()));
        assert!(names.contains(&"relayer_events_observed_total".to_string()));
    }
}
