//! Error types for fixbench operations.
//!
//! Each subsystem owns one error enum:
//! - Task loading and validation (`TaskError`)
//! - Sandbox execution faults (`SandboxError`)
//! - Run artifact persistence (`StorageError`)
//! - Engine configuration (`ConfigError`)
//! - Run orchestration (`OrchestratorError`)
//!
//! Patch rejections are a normal, scored outcome rather than a fault and
//! live next to the applier in [`crate::patch::PatchRejected`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading a task definition from the task root.
///
/// `Malformed` is fatal for the task and never retried.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task root '{0}' does not exist or is not a directory")]
    RootMissing(PathBuf),

    #[error("Task '{0}' not found")]
    NotFound(String),

    #[error("Task '{task_id}' is malformed: {reason}")]
    Malformed { task_id: String, reason: String },

    #[error("IO error reading task '{task_id}': {source}")]
    Io {
        task_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    /// Builds a `Malformed` error for the given task.
    pub fn malformed(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        TaskError::Malformed {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns the task id this error refers to, when known.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskError::RootMissing(_) => None,
            TaskError::NotFound(id) => Some(id),
            TaskError::Malformed { task_id, .. } | TaskError::Io { task_id, .. } => Some(task_id),
        }
    }
}

/// Harness faults: the execution itself could not be carried out.
///
/// These are retryable, unlike a failing test run which is a normal result.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Working directory '{0}' does not exist")]
    WorkingDirMissing(PathBuf),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Output pipe failure: {0}")]
    Pipe(String),

    #[error("Failed to materialize working tree: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Candidate source failure: {0}")]
    Candidate(String),
}

/// Errors that can occur while persisting run artifacts.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record '{0}' already exists and records are immutable")]
    RecordExists(String),

    #[error("Invalid record id '{0}'")]
    InvalidRecordId(String),

    #[error("Blob checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Errors raised while loading or validating the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that abort a whole run before or during dispatch.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("No tasks matched the selection")]
    NoTasks,

    #[error("No candidate sources were given")]
    NoCandidates,

    #[error("Candidate label '{0}' maps to the same record name as another source")]
    DuplicateCandidate(String),

    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_task_id() {
        let err = TaskError::malformed("t-1", "bad yaml");
        assert_eq!(err.task_id(), Some("t-1"));
        assert_eq!(err.to_string(), "Task 't-1' is malformed: bad yaml");

        let err = TaskError::RootMissing(PathBuf::from("/nope"));
        assert!(err.task_id().is_none());
    }

    #[test]
    fn test_orchestrator_error_wraps_task_error() {
        let err: OrchestratorError = TaskError::NotFound("x".into()).into();
        assert_eq!(err.to_string(), "Task 'x' not found");
    }
}
