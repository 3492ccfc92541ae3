use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use tracing::trace;

pub const REQUESTS_TOTAL: &str = "wayover_requests_total";
pub const STAGE_DURATION_MS: &str = "wayover_stage_duration_ms";
pub const UPLOAD_JOBS_TOTAL: &str = "wayover_upload_jobs_total";

/// Registers help text with the installed recorder.
pub fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Requests handled, by route");
    describe_histogram!(STAGE_DURATION_MS, "Pipeline stage duration in milliseconds");
    describe_counter!(UPLOAD_JOBS_TOTAL, "Upload jobs that reached a terminal state");
}

pub fn inc_requests(route: &'static str) {
    counter!(REQUESTS_TOTAL, "route" => route).increment(1);
    trace!(target = "wayover.metrics", route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!(STAGE_DURATION_MS, "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "wayover.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn job_finished(outcome: &'static str) {
    counter!(UPLOAD_JOBS_TOTAL, "outcome" => outcome).increment(1);
    trace!(target = "wayover.metrics", outcome, "upload_jobs_total_inc");
}
