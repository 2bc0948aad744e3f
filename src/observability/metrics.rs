//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (requests, latency, kernel errors, resets, recycles)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `resident_requests_total` (counter): handled requests by status
//! - `resident_request_duration_seconds` (histogram): decode to reset, per request
//! - `resident_kernel_errors_total` (counter): kernel errors and panics
//! - `resident_reset_failures_total` (counter): failed service resets by service
//! - `resident_worker_recycles_total` (counter): worker replacements by reason
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users and
//!   tests pay nothing
//! - Labels stay low-cardinality: status codes, service names, fixed reasons

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    metrics::describe_counter!("resident_requests_total", "Handled requests by status");
    metrics::describe_histogram!(
        "resident_request_duration_seconds",
        "Time from decode to the end of the reset phase"
    );
    metrics::describe_counter!("resident_kernel_errors_total", "Kernel errors and panics");
    metrics::describe_counter!("resident_reset_failures_total", "Failed service resets");
    metrics::describe_counter!("resident_worker_recycles_total", "Worker replacements");

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(status: u16, started: Instant) {
    metrics::counter!("resident_requests_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("resident_request_duration_seconds")
        .record(started.elapsed().as_secs_f64());
}

pub fn record_kernel_error() {
    metrics::counter!("resident_kernel_errors_total").increment(1);
}

pub fn record_reset_failure(service: &str) {
    metrics::counter!("resident_reset_failures_total", "service" => service.to_string())
        .increment(1);
}

pub fn record_worker_recycle(reason: &'static str) {
    metrics::counter!("resident_worker_recycles_total", "reason" => reason).increment(1);
}
