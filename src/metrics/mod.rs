//! Metrics module
//!
//! Prometheus counters and histograms for transfers and the HTTP requests
//! behind them. A CLI run has no scrape endpoint; [`write_textfile`] dumps
//! the registry for the node-exporter textfile collector instead.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::path::Path;

lazy_static! {
    // Transfer metrics
    pub static ref TRANSFERS_TOTAL: CounterVec = register_counter_vec!(
        "s3cli_transfers_total",
        "Total number of transfers",
        &["direction", "status"]
    ).unwrap();

    pub static ref TRANSFER_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "s3cli_transfer_bytes_total",
        "Total bytes moved",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFER_DURATION: HistogramVec = register_histogram_vec!(
        "s3cli_transfer_duration_seconds",
        "Transfer duration in seconds",
        &["direction"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    // Part metrics
    pub static ref PART_ATTEMPTS: CounterVec = register_counter_vec!(
        "s3cli_part_attempts_total",
        "Part attempts by outcome",
        &["direction", "outcome"]  // "success", "retry" or "failed"
    ).unwrap();

    pub static ref MULTIPART_ABORTS: CounterVec = register_counter_vec!(
        "s3cli_multipart_aborts_total",
        "AbortMultipartUpload calls",
        &["status"]
    ).unwrap();

    // HTTP metrics
    pub static ref HTTP_REQUESTS: CounterVec = register_counter_vec!(
        "s3cli_http_requests_total",
        "HTTP requests by method and outcome",
        &["method", "outcome"]
    ).unwrap();

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "s3cli_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 120.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "s3cli_errors_total",
        "Total errors",
        &["kind"]
    ).unwrap();
}

/// Record a finished transfer
pub fn record_transfer(direction: &str, status: &str, bytes: u64, duration_secs: f64) {
    TRANSFERS_TOTAL.with_label_values(&[direction, status]).inc();
    TRANSFER_BYTES_TOTAL
        .with_label_values(&[direction])
        .inc_by(bytes as f64);
    TRANSFER_DURATION
        .with_label_values(&[direction])
        .observe(duration_secs);
}

pub fn record_part_attempt(direction: &str, outcome: &str) {
    PART_ATTEMPTS.with_label_values(&[direction, outcome]).inc();
}

pub fn record_multipart_abort(status: &str) {
    MULTIPART_ABORTS.with_label_values(&[status]).inc();
}

/// Record one HTTP exchange
pub fn record_http_request(method: &str, outcome: &str, duration_secs: f64) {
    HTTP_REQUESTS.with_label_values(&[method, outcome]).inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record an error
pub fn record_error(kind: &str) {
    ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Write the exposition to `path` (temp file + rename, so the collector
/// never reads a half-written file)
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    let text = render().map_err(std::io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}
