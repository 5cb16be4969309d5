//! Job definitions for the scheduler.
//!
//! A job evaluates one candidate source against one task. Its state machine:
//!
//! ```text
//! Queued ──► Running ──► Succeeded | Failed | InfrastructureError | Cancelled
//!   │           │
//!   │           └──► Queued   (retry after an infrastructure error)
//!   └──► Cancelled            (cancelled before it started)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::candidate::label_slug;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    /// Evaluated and passed.
    Succeeded,
    /// Evaluated and not passed, including rejected patches.
    Failed,
    /// Could not be evaluated within the retry budget.
    InfrastructureError,
    Cancelled,
}

impl JobState {
    /// All states, in display order.
    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::InfrastructureError,
        JobState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded
                | JobState::Failed
                | JobState::InfrastructureError
                | JobState::Cancelled
        )
    }

    /// Returns whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, InfrastructureError)
                | (Running, Cancelled)
                | (Running, Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::InfrastructureError => write!(f, "infrastructure_error"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// One (task, candidate source) evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: String,
    /// Label of the candidate source.
    pub candidate: String,
    pub state: JobState,
    /// Attempts started so far.
    pub attempts: u32,
    /// First attempt plus retries.
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Infrastructure errors of earlier attempts, oldest first.
    #[serde(default)]
    pub infrastructure_errors: Vec<String>,
}

impl Job {
    /// Creates a queued job allowed `max_retries` retries.
    pub fn new(task_id: impl Into<String>, candidate: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            candidate: candidate.into(),
            state: JobState::Queued,
            attempts: 0,
            max_attempts: max_retries.saturating_add(1),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            infrastructure_errors: Vec::new(),
        }
    }

    /// Moves to `next`, stamping start and finish times.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Starts the next attempt.
    pub fn begin_attempt(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobState::Running)?;
        self.attempts += 1;
        Ok(())
    }

    /// Records an infrastructure error for the current attempt.
    ///
    /// Requeues the job when retries remain and returns `true`; otherwise the
    /// job ends in `InfrastructureError`.
    pub fn record_infrastructure_error(
        &mut self,
        error: impl Into<String>,
    ) -> Result<bool, InvalidTransition> {
        self.infrastructure_errors.push(error.into());
        if self.should_retry() {
            self.transition(JobState::Queued)?;
            Ok(true)
        } else {
            self.transition(JobState::InfrastructureError)?;
            Ok(false)
        }
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Record id: `<task>.<candidate>.<attempts>`.
    pub fn record_id(&self) -> String {
        format!("{}.{}.{}", self.task_id, label_slug(&self.candidate), self.attempts)
    }
}
