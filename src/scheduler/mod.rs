//! Job scheduling for evaluation runs.
//!
//! - **Job**: one (task, candidate source) evaluation and its state machine
//! - **RunOrchestrator**: bounded worker pool that drives every job of a run
//!   to a terminal state and writes its record
//!
//! # Architecture
//!
//! ```text
//!        tasks x candidate sources
//!                  │
//!           ┌──────▼───────┐
//!           │  Semaphore   │  (EngineConfig::workers permits)
//!           └──────┬───────┘
//!                  │
//!      ┌───────────┼───────────┐
//!      ▼           ▼           ▼
//!  ┌───────┐   ┌───────┐   ┌───────┐
//!  │ Job 1 │   │ Job 2 │   │ Job N │   prepare -> verify -> score
//!  └───┬───┘   └───┬───┘   └───┬───┘
//!      └───────────┼───────────┘
//!                  ▼
//!          RunArtifactStore    records/, blobs/, manifest.json
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fixbench::scheduler::RunOrchestrator;
//! use fixbench::candidate::parse_selector;
//!
//! let orchestrator = RunOrchestrator::new(config, "runs");
//! let cancel = orchestrator.cancellation_token();
//! let summary = orchestrator.run(tasks, &[parse_selector("reference")?]).await?;
//! println!("{} passed", summary.manifest.totals.passed);
//! ```

pub mod job;
pub mod worker_pool;

pub use job::{InvalidTransition, Job, JobState};
pub use worker_pool::{PoolStats, RunOrchestrator, RunSummary};
