//! Prometheus metrics for monitoring ingestion health.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use crate::parsers::ParseOutcome;
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // ==================== LATENCY METRICS ====================

    pub static ref PARSE_DURATION: HistogramVec = register_histogram_vec!(
        "radar_feed_parse_duration_seconds",
        "Time spent parsing CSV lines by ingestion source",
        &["source"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref ROWS_PARSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "radar_feed_rows_parsed_total",
        "Valid CSV rows ingested by source",
        &["source"]
    )
    .unwrap();
    pub static ref ROWS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "radar_feed_rows_rejected_total",
        "CSV rows dropped by validation by source",
        &["source"]
    )
    .unwrap();
    pub static ref REPLAY_LOOPS_TOTAL: IntCounter = register_int_counter!(
        "radar_feed_replay_loops_total",
        "Times replay playback wrapped back to the first timestamp"
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================
    pub static ref INGESTION_FAULTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "radar_feed_ingestion_faults_total",
        "Tail read cycles that failed or produced no valid rows",
        &["kind"]
    )
    .unwrap();
    pub static ref TAIL_RELOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "radar_feed_tail_reloads_total",
        "Full reloads of the tailed file by trigger",
        &["reason"]
    )
    .unwrap();
    pub static ref WATCHER_RESTARTS_TOTAL: IntCounter = register_int_counter!(
        "radar_feed_watcher_restarts_total",
        "File watches re-armed after a watcher failure"
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref LOADED_SAMPLES: IntGauge = register_int_gauge!(
        "radar_feed_loaded_samples",
        "Samples currently held by the active engine"
    )
    .unwrap();
}

/// Record counts and latency for one parse pass.
pub fn record_parse(source: &str, outcome: &ParseOutcome, elapsed: Duration) {
    PARSE_DURATION
        .with_label_values(&[source])
        .observe(elapsed.as_secs_f64());
    ROWS_PARSED_TOTAL
        .with_label_values(&[source])
        .inc_by(outcome.accepted() as u64);
    ROWS_REJECTED_TOTAL
        .with_label_values(&[source])
        .inc_by(outcome.rejected as u64);
}

/// Render the default registry in the Prometheus text format.
pub fn encode() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode prometheus metrics")?;
    Ok((encoder.format_type().to_string(), buffer))
}
