//! Prometheus metrics for evaluation runs.
//!
//! Metrics are recorded through [`MetricsCollector`] while a run progresses
//! and exported once, as text, to the run's `metrics.prom`.
//!
//! # Example
//!
//! ```ignore
//! use fixbench::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_score(1.0);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, PATCHES_REJECTED, REGISTRY, RETRIES_TOTAL, SANDBOX_DURATION,
    SCORE,
};
