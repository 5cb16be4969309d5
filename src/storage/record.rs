//! Run records: the immutable, per-job evidence of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::Provenance;
use crate::patch::{PatchRejected, PatchSummary};
use crate::sandbox::ExecutionSummary;
use crate::scheduler::JobState;
use crate::scoring::Score;
use crate::task::{StrategyKind, Task};
use crate::verification::{StructureMatch, Verdict, VerificationDetail};

/// Task identity as recorded, including its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub category: String,
    pub engine: String,
    pub tier: u8,
    pub strategy: StrategyKind,
    pub digest: String,
}

impl From<&Task> for TaskRef {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            category: task.category.clone(),
            engine: task.engine.clone(),
            tier: task.tier,
            strategy: task.strategy(),
            digest: task.digest.clone(),
        }
    }
}

/// Terminal record of one job. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub record_id: String,
    pub run_id: String,
    pub task: TaskRef,
    pub candidate: Provenance,
    pub state: JobState,
    pub attempts: u32,
    /// What the candidate's patch actually changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchSummary>,
    /// Unified diff of the starting tree against the post-image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_diff_blob: Option<String>,
    #[serde(default)]
    pub executions: Vec<ExecutionSummary>,
    #[serde(default)]
    pub samples: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub score: Score,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<StructureMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<VerificationDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<PatchRejected>,
    /// Error of the last attempt when the job ended in `InfrastructureError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_error: Option<String>,
    /// Infrastructure errors of all attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infrastructure_errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl RunRecord {
    /// Passed under its scoring policy.
    pub fn passed(&self) -> bool {
        self.state == JobState::Succeeded
    }

    /// The candidate was evaluated (scored), whatever the result.
    pub fn evaluated(&self) -> bool {
        matches!(self.state, JobState::Succeeded | JobState::Failed)
    }
}
