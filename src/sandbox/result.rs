//! Execution results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::output::CapturedStream;

/// How the process ended with respect to its resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOutcome {
    Completed,
    TimedOut,
    #[serde(rename = "oom_killed")]
    OomKilled,
    SignalTerminated,
}

impl std::fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceOutcome::Completed => write!(f, "completed"),
            ResourceOutcome::TimedOut => write!(f, "timed_out"),
            ResourceOutcome::OomKilled => write!(f, "oom_killed"),
            ResourceOutcome::SignalTerminated => write!(f, "signal_terminated"),
        }
    }
}

/// Outcome of exactly one executor call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Command line that was run, or a label for synthetic results.
    pub command: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub duration: Duration,
    pub outcome: ResourceOutcome,
    /// The run was stopped by cancellation rather than by its own limits.
    pub cancelled: bool,
}

impl ExecutionResult {
    /// Result for work done without a process (static checks).
    pub fn synthetic(label: impl Into<String>) -> Self {
        Self {
            command: label.into(),
            exit_code: Some(0),
            signal: None,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            duration: Duration::ZERO,
            outcome: ResourceOutcome::Completed,
            cancelled: false,
        }
    }

    /// Exited 0 within its limits.
    pub fn succeeded(&self) -> bool {
        self.outcome == ResourceOutcome::Completed && self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.to_string_lossy()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.to_string_lossy()
    }

    /// Compact, serializable view for run records.
    ///
    /// Keeps the last `excerpt_bytes` of each stream.
    pub fn summary(&self, excerpt_bytes: usize) -> ExecutionSummary {
        ExecutionSummary {
            command: self.command.clone(),
            exit_code: self.exit_code,
            signal: self.signal,
            outcome: self.outcome,
            duration_ms: self.duration.as_millis() as u64,
            cancelled: self.cancelled,
            stdout_excerpt: tail(&self.stdout_text(), excerpt_bytes),
            stderr_excerpt: tail(&self.stderr_text(), excerpt_bytes),
            stdout_truncated: self.stdout.truncated,
            stderr_truncated: self.stderr.truncated,
            stdout_bytes: self.stdout.total_bytes,
            stderr_bytes: self.stderr.total_bytes,
            stdout_blob: None,
            stderr_blob: None,
        }
    }
}

/// Serializable summary of an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub command: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub outcome: ResourceOutcome,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// Digest of the full captured stdout in the run's blob store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_blob: Option<String>,
}

/// Last `max_bytes` of `s`, cut on a char boundary.
fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_result_succeeds() {
        let result = ExecutionResult::synthetic("static-check");
        assert!(result.succeeded());
        assert_eq!(result.duration, Duration::ZERO);
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "...def");
        // 'é' is two bytes; cutting in its middle moves forward.
        assert_eq!(tail("aé", 1), "...");
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceOutcome::OomKilled).expect("serialize");
        assert_eq!(json, "\"oom_killed\"");
        let json = serde_json::to_string(&ResourceOutcome::TimedOut).expect("serialize");
        assert_eq!(json, "\"timed_out\"");
    }
}
