//! Prometheus metrics registration and export.
//!
//! All fixbench metrics live in one registry held in `OnceLock` statics.
//! Recording before [`init_metrics`] is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all fixbench metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs reaching a terminal state, labeled by state, category and candidate.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall time of sandboxed commands in seconds, labeled by outcome.
pub static SANDBOX_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Distribution of scores of evaluated jobs.
pub static SCORE: OnceLock<Histogram> = OnceLock::new();

/// Number of jobs currently running.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Patches rejected before anything ran, labeled by reason.
pub static PATCHES_REJECTED: OnceLock<CounterVec> = OnceLock::new();

/// Attempts retried after an infrastructure error.
pub static RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls keep the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("fixbench_jobs_total", "Jobs reaching a terminal state"),
        &["state", "category", "candidate"],
    )?;

    let sandbox_duration = HistogramVec::new(
        HistogramOpts::new(
            "fixbench_sandbox_duration_seconds",
            "Wall time of sandboxed commands in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["outcome"],
    )?;

    let score = Histogram::with_opts(
        HistogramOpts::new("fixbench_score", "Distribution of scores of evaluated jobs")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let jobs_in_progress =
        Gauge::new("fixbench_jobs_in_progress", "Number of jobs currently running")?;

    let patches_rejected = CounterVec::new(
        Opts::new("fixbench_patches_rejected_total", "Candidate patches rejected before execution"),
        &["reason"],
    )?;

    let retries_total = IntCounter::new(
        "fixbench_retries_total",
        "Attempts retried after an infrastructure error",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(sandbox_duration.clone()))?;
    registry.register(Box::new(score.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(patches_rejected.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;

    // A concurrent initializer may win; its metrics are then the live ones.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = SANDBOX_DURATION.set(sandbox_duration);
    let _ = SCORE.set(score);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = PATCHES_REJECTED.set(patches_rejected);
    let _ = RETRIES_TOTAL.set(retries_total);

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
