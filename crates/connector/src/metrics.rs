//! Prometheus metrics for the ingestion pipeline
//!
//! Updated through `PipelineStats`; components never touch these directly.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

const LABEL_OUTCOME: &str = "outcome";

/// Records by pipeline outcome: received, enqueued, dropped, written, rejected, failed
static RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "optfeed_records_total",
        "Quote records by pipeline outcome",
        &[LABEL_OUTCOME]
    )
    .expect("Failed to register records_total metric")
});

static PARSE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "optfeed_parse_errors_total",
        "Inbound frames discarded as malformed"
    )
    .expect("Failed to register parse_errors_total metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("optfeed_reconnects_total", "Feed connection reconnect attempts")
        .expect("Failed to register reconnects_total metric")
});

static WRITE_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("optfeed_write_retries_total", "Batch write retries")
        .expect("Failed to register write_retries_total metric")
});

static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("optfeed_queue_depth", "Records waiting in the ingest queue")
        .expect("Failed to register queue_depth metric")
});

/// 0 = closed, 1 = open, 2 = half-open
static CIRCUIT_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "optfeed_circuit_state",
        "Writer circuit breaker state (0=closed, 1=open, 2=half_open)"
    )
    .expect("Failed to register circuit_state metric")
});

static CONNECTED_SHARDS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("optfeed_connected_shards", "Feed shards currently streaming")
        .expect("Failed to register connected_shards metric")
});

static SUBSCRIBED_SYMBOLS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("optfeed_subscribed_symbols", "Symbols in the subscription set")
        .expect("Failed to register subscribed_symbols metric")
});

static BATCH_WRITE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "optfeed_batch_write_seconds",
        "Latency of a single batch write call",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register batch_write_seconds metric")
});

pub(crate) fn inc_records(outcome: &str, n: u64) {
    RECORDS_TOTAL.with_label_values(&[outcome]).inc_by(n);
}

pub(crate) fn inc_parse_errors() {
    PARSE_ERRORS_TOTAL.inc();
}

pub(crate) fn inc_reconnects() {
    RECONNECTS_TOTAL.inc();
}

pub(crate) fn inc_write_retries() {
    WRITE_RETRIES_TOTAL.inc();
}

pub(crate) fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

pub(crate) fn set_circuit_state(state: i64) {
    CIRCUIT_STATE.set(state);
}

pub(crate) fn set_connected_shards(count: i64) {
    CONNECTED_SHARDS.set(count);
}

pub(crate) fn set_subscribed_symbols(count: usize) {
    SUBSCRIBED_SYMBOLS.set(count as i64);
}

pub(crate) fn observe_batch_write(seconds: f64) {
    BATCH_WRITE_SECONDS.observe(seconds);
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_encode() {
        inc_records("written", 3);
        set_queue_depth(7);
        set_circuit_state(1);
        observe_batch_write(0.02);

        let output = encode_metrics().unwrap();
        assert!(output.contains("optfeed_records_total"));
        assert!(output.contains("optfeed_queue_depth"));
        assert!(output.contains("optfeed_batch_write_seconds"));
    }
}
