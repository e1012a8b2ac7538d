//! Observability: per-api-key frame counters, filter-dispatch latency
//! histograms, KMS call counters/latencies, DEK rotation counts, and the
//! decrypt-cache hit ratio.
//!
//! Grounded in the `estuary-flow` example repo's `dekaf` crate, which wires
//! up `metrics` + `metrics-exporter-prometheus` the same way for a
//! Kafka-facing gateway. Serving the scrape endpoint itself is left to the
//! operator; this module only owns the recorder and the counter/histogram
//! call sites the rest of the crate uses.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the process-wide Prometheus recorder. Call once at startup.
/// Returns a handle whose `render()` an external admin endpoint can expose;
/// wiring that endpoint up is out of scope for this crate.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder")
}

pub fn record_frame(direction: &'static str, api_key: i16, decoded: bool) {
    metrics::counter!(
        "kroxide_frames_total",
        "direction" => direction,
        "api_key" => api_key.to_string(),
        "decoded" => decoded.to_string(),
    )
    .increment(1);
}

pub fn record_filter_dispatch(filter_name: &str, outcome: &'static str, elapsed_secs: f64) {
    metrics::histogram!(
        "kroxide_filter_dispatch_seconds",
        "filter" => filter_name.to_string(),
        "outcome" => outcome,
    )
    .record(elapsed_secs);
}

pub fn record_kms_call(operation: &'static str, outcome: &'static str, elapsed_secs: f64) {
    metrics::counter!(
        "kroxide_kms_calls_total",
        "operation" => operation,
        "outcome" => outcome,
    )
    .increment(1);
    metrics::histogram!(
        "kroxide_kms_call_seconds",
        "operation" => operation,
    )
    .record(elapsed_secs);
}

pub fn record_dek_rotation(kek_id: &str) {
    metrics::counter!("kroxide_dek_rotations_total", "kek_id" => kek_id.to_string()).increment(1);
}

pub fn record_decrypt_cache(hit: bool) {
    metrics::counter!("kroxide_decrypt_cache_total", "hit" => hit.to_string()).increment(1);
}
