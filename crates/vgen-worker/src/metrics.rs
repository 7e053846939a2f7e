//! Worker metrics.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Metric names as constants for consistency.
pub mod names {
    pub const STAGES_COMPLETED_TOTAL: &str = "vgen_stages_completed_total";
    pub const STAGES_FAILED_TOTAL: &str = "vgen_stages_failed_total";
    pub const STAGE_DURATION_SECONDS: &str = "vgen_stage_duration_seconds";

    pub const JOBS_COMPLETED_TOTAL: &str = "vgen_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vgen_jobs_failed_total";

    pub const RENDERS_STARTED_TOTAL: &str = "vgen_renders_started_total";
    pub const RENDERS_COMPLETED_TOTAL: &str = "vgen_renders_completed_total";
    pub const RENDERS_FAILED_TOTAL: &str = "vgen_renders_failed_total";
    pub const RENDERS_DEDUPLICATED_TOTAL: &str = "vgen_renders_deduplicated_total";
    pub const RENDERS_EVICTED_TOTAL: &str = "vgen_renders_evicted_total";
    pub const RENDER_DURATION_SECONDS: &str = "vgen_render_duration_seconds";
}

/// Install the Prometheus exporter, serving `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

pub fn record_stage_completed(stage: &str, duration_secs: f64) {
    let labels = [("stage", stage.to_string())];
    counter!(names::STAGES_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_stage_failed(stage: &str, kind: &str) {
    let labels = [("stage", stage.to_string()), ("kind", kind.to_string())];
    counter!(names::STAGES_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_completed() {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
}

pub fn record_job_failed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_render_started() {
    counter!(names::RENDERS_STARTED_TOTAL).increment(1);
}

pub fn record_render_completed(duration_secs: f64) {
    counter!(names::RENDERS_COMPLETED_TOTAL).increment(1);
    histogram!(names::RENDER_DURATION_SECONDS).record(duration_secs);
}

pub fn record_render_failed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::RENDERS_FAILED_TOTAL, &labels).increment(1);
}

/// `reason` is "existing" for a completed file, "in_flight" for a coalesced call.
pub fn record_render_deduplicated(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::RENDERS_DEDUPLICATED_TOTAL, &labels).increment(1);
}

pub fn record_renders_evicted(count: usize) {
    counter!(names::RENDERS_EVICTED_TOTAL).increment(count as u64);
}
