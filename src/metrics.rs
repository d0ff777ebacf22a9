//! Prometheus metrics for the social graph cache

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder};

lazy_static! {
    /// Counter: cache reads by table and result (hit, miss, expired)
    pub static ref CACHE_READS: CounterVec = register_counter_vec!(
        "followgraph_cache_reads_total",
        "Cache reads by table and result",
        &["table", "result"]
    )
    .expect("Failed to create cache_reads metric");

    /// Counter: follow/unfollow mutations by outcome
    pub static ref MUTATIONS: CounterVec = register_counter_vec!(
        "followgraph_mutations_total",
        "Follow mutations by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("Failed to create mutations metric");

    /// Counter: rollbacks, applied or skipped because a newer write superseded them
    pub static ref ROLLBACKS: CounterVec = register_counter_vec!(
        "followgraph_rollbacks_total",
        "Optimistic rollbacks by disposition",
        &["disposition"]
    )
    .expect("Failed to create rollbacks metric");

    /// Counter: push events received by stream and change type
    pub static ref PUSH_EVENTS: CounterVec = register_counter_vec!(
        "followgraph_push_events_total",
        "Push events by stream and change type",
        &["stream", "change"]
    )
    .expect("Failed to create push_events metric");

    /// Counter: persistence failures by operation
    pub static ref PERSISTENCE_FAILURES: CounterVec = register_counter_vec!(
        "followgraph_persistence_failures_total",
        "Persistence failures by operation",
        &["operation"]
    )
    .expect("Failed to create persistence_failures metric");

    /// Counter: entries removed by the expiry sweep
    pub static ref SWEPT_ENTRIES: CounterVec = register_counter_vec!(
        "followgraph_swept_entries_total",
        "Entries removed by the expiry sweep",
        &["table"]
    )
    .expect("Failed to create swept_entries metric");

    /// Gauge: entries currently held per table
    pub static ref CACHE_ENTRIES: GaugeVec = register_gauge_vec!(
        "followgraph_cache_entries",
        "Entries currently held per table",
        &["table"]
    )
    .expect("Failed to create cache_entries metric");
}

pub fn record_read(table: &str, result: &str) {
    CACHE_READS.with_label_values(&[table, result]).inc();
}

pub fn record_mutation(kind: &str, outcome: &str) {
    MUTATIONS.with_label_values(&[kind, outcome]).inc();
}

pub fn record_rollback(disposition: &str) {
    ROLLBACKS.with_label_values(&[disposition]).inc();
}

pub fn record_push_event(stream: &str, change: &str) {
    PUSH_EVENTS.with_label_values(&[stream, change]).inc();
}

pub fn record_persistence_failure(operation: &str) {
    PERSISTENCE_FAILURES.with_label_values(&[operation]).inc();
}

pub fn record_swept(table: &str, count: usize) {
    SWEPT_ENTRIES
        .with_label_values(&[table])
        .inc_by(count as f64);
}

pub fn set_entries(table: &str, count: usize) {
    CACHE_ENTRIES.with_label_values(&[table]).set(count as f64);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
