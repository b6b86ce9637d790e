//! Prometheus metrics for the reconciliation engine.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for matching runs by outcome.
pub static MATCH_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_match_runs_total",
        "Total number of goal matching runs",
        &["status"]
    )
    .expect("Failed to register MATCH_RUNS")
});

/// Counter for matches by type.
pub static MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_matches_total",
        "Total number of matches produced",
        &["match_type"]
    )
    .expect("Failed to register MATCHES")
});

/// Counter for detected variances by kind and severity.
pub static VARIANCES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_variances_total",
        "Total number of detected variances",
        &["kind", "severity"]
    )
    .expect("Failed to register VARIANCES")
});

/// Counter for sweep resolutions by review tag.
pub static SWEEP_RESOLUTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_sweep_resolutions_total",
        "Total number of variances resolved by the sweep",
        &["tag"]
    )
    .expect("Failed to register SWEEP_RESOLUTIONS")
});

/// Histogram for engine operation duration.
pub static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recon_operation_duration_seconds",
        "Engine operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register OPERATION_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&MATCH_RUNS);
    Lazy::force(&MATCHES);
    Lazy::force(&VARIANCES);
    Lazy::force(&SWEEP_RESOLUTIONS);
    Lazy::force(&OPERATION_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Record a matching run.
pub fn record_match_run(status: &str) {
    MATCH_RUNS.with_label_values(&[status]).inc();
}

/// Record a produced match.
pub fn record_match(match_type: &str) {
    MATCHES.with_label_values(&[match_type]).inc();
}

/// Record a detected variance.
pub fn record_variance(kind: &str, severity: &str) {
    VARIANCES.with_label_values(&[kind, severity]).inc();
}

/// Record a sweep resolution.
pub fn record_sweep_resolution(tag: &str) {
    SWEEP_RESOLUTIONS.with_label_values(&[tag]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
