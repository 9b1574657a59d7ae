//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the generation pipeline
//! with standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all FilingForge metrics
pub const METRICS_PREFIX: &str = "filingforge";

/// Histogram buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
];

/// Buckets for completion latency (much slower than requests)
pub const COMPLETION_BUCKETS: &[f64] = &[
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 1m
    120.0, // 2m
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Completion metrics
    describe_counter!(
        format!("{}_completion_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Completion service calls by stage and outcome"
    );

    describe_histogram!(
        format!("{}_completion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Completion call latency in seconds"
    );

    describe_counter!(
        format!("{}_completion_tokens_total", METRICS_PREFIX),
        Unit::Count,
        "Tokens consumed by completion calls"
    );

    describe_counter!(
        format!("{}_completion_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Completion calls retried after a transient failure"
    );

    // Generation cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Stage units served from stored content"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Stage units that required generation"
    );

    // Pipeline metrics
    describe_counter!(
        format!("{}_stage_units_total", METRICS_PREFIX),
        Unit::Count,
        "Stage units resolved, by stage and outcome"
    );

    describe_counter!(
        format!("{}_jobs_finished_total", METRICS_PREFIX),
        Unit::Count,
        "Pipeline jobs reaching a terminal state"
    );

    describe_gauge!(
        format!("{}_jobs_running", METRICS_PREFIX),
        Unit::Count,
        "Pipeline jobs currently running in this process"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record one completion call
pub fn record_completion(
    duration_secs: f64,
    stage: &str,
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    success: bool,
) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_completion_calls_total", METRICS_PREFIX),
        "stage" => stage.to_string(),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    histogram!(
        format!("{}_completion_duration_seconds", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .record(duration_secs);

    if success {
        counter!(
            format!("{}_completion_tokens_total", METRICS_PREFIX),
            "stage" => stage.to_string(),
            "direction" => "input"
        )
        .increment(input_tokens);

        counter!(
            format!("{}_completion_tokens_total", METRICS_PREFIX),
            "stage" => stage.to_string(),
            "direction" => "output"
        )
        .increment(output_tokens);
    }
}

/// Helper to record a retried completion call
pub fn record_retry(stage: &str) {
    counter!(
        format!("{}_completion_retries_total", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Helper to record generation cache metrics
pub fn record_cache(hit: bool, stage: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "stage" => stage.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "stage" => stage.to_string()
        )
        .increment(1);
    }
}

/// Helper to record a resolved stage unit
pub fn record_unit(stage: &str, outcome: &str) {
    counter!(
        format!("{}_stage_units_total", METRICS_PREFIX),
        "stage" => stage.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Helper to track running jobs
pub fn record_job_started() {
    gauge!(format!("{}_jobs_running", METRICS_PREFIX)).increment(1.0);
}

/// Helper to record a job reaching its terminal state
pub fn record_job_finished(state: &str) {
    gauge!(format!("{}_jobs_running", METRICS_PREFIX)).decrement(1.0);

    counter!(
        format!("{}_jobs_finished_total", METRICS_PREFIX),
        "state" => state.to_string()
    )
    .increment(1);
}
