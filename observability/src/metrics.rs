//! Metric names and recording helpers.
//!
//! Every counter the substrate emits is named here so dashboards and tests
//! agree on one spelling.

use metrics::{counter, histogram};

pub const JOBS_ENQUEUED: &str = "jobs.enqueued";
pub const JOBS_CLAIMED: &str = "jobs.claimed";
pub const JOBS_COMPLETED: &str = "jobs.completed";
pub const JOBS_FAILED: &str = "jobs.failed";
pub const JOBS_EXHAUSTED: &str = "jobs.exhausted";
pub const JOBS_RECLAIMED: &str = "jobs.reclaimed";
pub const INTEGRATION_SCORED: &str = "integration.scored";
pub const INTEGRATION_FRICTION: &str = "integration.max_friction";
pub const MIRROR_APPLIED: &str = "mirror.applied";
pub const MIRROR_GAP: &str = "mirror.gap";
pub const AUDIT_DROPPED: &str = "audit.dropped";
pub const AUDIT_WRITTEN: &str = "audit.written";
pub const AUDIT_WRITE_FAILED: &str = "audit.write_failed";
pub const CONTENTION_RETRIES: &str = "storage.contention_retries";

pub fn record_job_enqueued(job_type: &str) {
    counter!(JOBS_ENQUEUED, "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_claimed(job_type: &str) {
    counter!(JOBS_CLAIMED, "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_completed(job_type: &str) {
    counter!(JOBS_COMPLETED, "job_type" => job_type.to_string()).increment(1);
}

/// One failed attempt. `exhausted` marks the attempt that spent the last
/// retry.
pub fn record_job_failed(job_type: &str, exhausted: bool) {
    counter!(JOBS_FAILED, "job_type" => job_type.to_string()).increment(1);
    if exhausted {
        counter!(JOBS_EXHAUSTED, "job_type" => job_type.to_string()).increment(1);
    }
}

pub fn record_jobs_reclaimed(requeued: usize, exhausted: usize) {
    counter!(JOBS_RECLAIMED, "outcome" => "requeued").increment(requeued as u64);
    counter!(JOBS_RECLAIMED, "outcome" => "exhausted").increment(exhausted as u64);
}

pub fn record_integration_scored(status: &str, max_friction: f64) {
    counter!(INTEGRATION_SCORED, "status" => status.to_string()).increment(1);
    histogram!(INTEGRATION_FRICTION).record(max_friction);
}

pub fn record_mirrors_applied(count: usize) {
    counter!(MIRROR_APPLIED).increment(count as u64);
}

pub fn record_mirror_gap() {
    counter!(MIRROR_GAP).increment(1);
}

pub fn record_audit_dropped() {
    counter!(AUDIT_DROPPED).increment(1);
}

pub fn record_audit_written(count: usize) {
    counter!(AUDIT_WRITTEN).increment(count as u64);
}

pub fn record_audit_write_failed(count: usize) {
    counter!(AUDIT_WRITE_FAILED).increment(count as u64);
}

pub fn record_contention_retry(operation: &'static str) {
    counter!(CONTENTION_RETRIES, "operation" => operation).increment(1);
}
