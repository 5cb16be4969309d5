//! fixbench: sandboxed evaluation of candidate fix patches.
//!
//! A run takes a directory of benchmark tasks and one or more candidate
//! sources. For every (task, candidate) pair the engine applies the patch to
//! a fresh working tree, runs the task's harness in a resource-limited
//! process group, scores the verdict and writes a record.

// Core modules
pub mod candidate;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod patch;
pub mod pipeline;
pub mod sandbox;
pub mod scheduler;
pub mod scoring;
pub mod storage;
pub mod task;
pub mod validation;
pub mod verification;
pub mod workspace;

// Re-export commonly used error types
pub use error::{ConfigError, OrchestratorError, SandboxError, StorageError, TaskError};
pub use patch::PatchRejected;
