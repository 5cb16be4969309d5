//! Metric recording for the evaluation engine.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so callers never deal
//! with label order or uninitialized metrics.

use super::prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, PATCHES_REJECTED, RETRIES_TOTAL, SANDBOX_DURATION, SCORE,
};
use crate::patch::PatchRejected;
use crate::sandbox::ExecutionResult;
use crate::scheduler::JobState;

/// Metrics collector for recording fixbench operational metrics.
///
/// Metrics must be initialized with `init_metrics()` first; until then every
/// method is a no-op.
///
/// # Example
///
/// ```ignore
/// use fixbench::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_job(JobState::Succeeded, "off_by_one", "reference");
/// collector.record_score(0.8);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching its terminal state.
    pub fn record_job(&self, state: JobState, category: &str, candidate: &str) {
        let state = state.to_string();
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[state.as_str(), category, candidate])
                .inc();
        }

        tracing::trace!(
            state = %state,
            category = category,
            candidate = candidate,
            "Recorded job metric"
        );
    }

    /// Record one sandboxed command.
    pub fn record_execution(&self, result: &ExecutionResult) {
        let outcome = if result.cancelled {
            "cancelled".to_string()
        } else {
            result.outcome.to_string()
        };
        if let Some(duration) = SANDBOX_DURATION.get() {
            duration
                .with_label_values(&[outcome.as_str()])
                .observe(result.duration.as_secs_f64());
        }
    }

    /// Record the score of an evaluated job.
    pub fn record_score(&self, score: f64) {
        if let Some(histogram) = SCORE.get() {
            histogram.observe(score);
        }
    }

    /// Record a patch rejected before execution.
    pub fn record_rejection(&self, rejection: &PatchRejected) {
        let reason = rejection_reason(rejection);
        if let Some(rejected) = PATCHES_REJECTED.get() {
            rejected.with_label_values(&[reason]).inc();
        }
        tracing::trace!(reason = reason, "Recorded patch rejection metric");
    }

    /// Record an attempt that will be retried.
    pub fn record_retry(&self) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

fn rejection_reason(rejection: &PatchRejected) -> &'static str {
    match rejection {
        PatchRejected::Malformed { .. } => "malformed",
        PatchRejected::ContextMismatch { .. } => "context_mismatch",
        PatchRejected::PolicyViolation { .. } => "policy_violation",
        PatchRejected::MissingFile { .. } => "missing_file",
        PatchRejected::FileExists { .. } => "file_exists",
        PatchRejected::NoCandidate => "no_candidate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};
    use crate::sandbox::ResourceOutcome;

    #[test]
    fn test_rejection_reason_labels() {
        assert_eq!(rejection_reason(&PatchRejected::NoCandidate), "no_candidate");
        assert_eq!(
            rejection_reason(&PatchRejected::MissingFile { path: "x".into() }),
            "missing_file"
        );
    }

    #[test]
    fn test_recorded_metrics_are_exported() {
        init_metrics().expect("init");
        let collector = MetricsCollector::new();

        collector.record_job(JobState::Failed, "bounds_check", "model-x");
        collector.record_score(0.8);
        collector.record_rejection(&PatchRejected::NoCandidate);

        let mut timed_out = ExecutionResult::synthetic("sleep 10");
        timed_out.outcome = ResourceOutcome::TimedOut;
        collector.record_execution(&timed_out);

        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();

        let text = export_metrics();
        assert!(text.contains("fixbench_jobs_total"));
        assert!(text.contains("category=\"bounds_check\""));
        assert!(text.contains("outcome=\"timed_out\""));
        assert!(text.contains("reason=\"no_candidate\""));
    }
}
