//! Discriminating-test validation.
//!
//! A task is only useful if its harness tells a fix from no fix: the
//! reference patch must pass and the unpatched baseline must fail. The
//! validator runs both through the normal engine and checks the records.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::candidate::{BaselineSource, CandidateSource, ReferenceSource};
use crate::error::OrchestratorError;
use crate::scheduler::{JobState, RunOrchestrator};
use crate::storage::RunRecord;
use crate::task::Task;

/// Result of an individual validation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Name of the check that was performed.
    pub check_name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Optional message with details about the check result.
    pub message: Option<String>,
}

impl CheckResult {
    /// Create a passing check result.
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            check_name: name.into(),
            passed: true,
            message: None,
        }
    }

    /// Create a failing check result with a reason.
    pub fn fail(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            check_name: name.into(),
            passed: false,
            message: Some(reason.into()),
        }
    }
}

/// All checks of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskValidationResult {
    pub task_id: String,
    /// Whether all validation checks passed.
    pub valid: bool,
    pub checks: Vec<CheckResult>,
    pub summary: String,
}

impl TaskValidationResult {
    /// Create a validation result from check results.
    pub fn new(task_id: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        let total = checks.len();
        let failed = checks.iter().filter(|c| !c.passed).count();
        let valid = failed == 0;
        let summary = if valid {
            format!("All {} checks passed", total)
        } else {
            format!("{} of {} checks failed", failed, total)
        };
        Self {
            task_id: task_id.into(),
            valid,
            checks,
            summary,
        }
    }
}

/// Outcome of validating a set of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub results: Vec<TaskValidationResult>,
}

impl ValidationReport {
    pub fn all_valid(&self) -> bool {
        self.results.iter().all(|r| r.valid)
    }

    /// Ids of tasks that failed at least one check.
    pub fn non_discriminating(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.valid)
            .map(|r| r.task_id.as_str())
            .collect()
    }
}

/// Checks one task's reference and baseline records.
pub fn check_task(
    task_id: &str,
    has_reference: bool,
    reference: Option<&RunRecord>,
    baseline: Option<&RunRecord>,
) -> TaskValidationResult {
    let mut checks = Vec::new();

    if has_reference {
        checks.push(CheckResult::pass("reference_present"));
    } else {
        checks.push(CheckResult::fail("reference_present", "task has no reference patch"));
    }

    checks.push(match reference {
        Some(r) if r.state == JobState::Succeeded => CheckResult::pass("reference_passes"),
        Some(r) => CheckResult::fail("reference_passes", describe(r)),
        None => CheckResult::fail("reference_passes", "no record for the reference patch"),
    });

    checks.push(match baseline {
        Some(r) if r.state == JobState::Failed => CheckResult::pass("baseline_fails"),
        Some(r) if r.state == JobState::Succeeded => CheckResult::fail(
            "baseline_fails",
            format!("unpatched code passes (score {:.2})", r.score.value),
        ),
        Some(r) => CheckResult::fail("baseline_fails", describe(r)),
        None => CheckResult::fail("baseline_fails", "no record for the baseline"),
    });

    TaskValidationResult::new(task_id, checks)
}

fn describe(record: &RunRecord) -> String {
    match record.state {
        JobState::InfrastructureError => format!(
            "could not be evaluated: {}",
            record.infrastructure_error.as_deref().unwrap_or("infrastructure error")
        ),
        JobState::Cancelled => "cancelled before it was evaluated".to_string(),
        _ => match &record.rejection {
            Some(rejection) => format!("patch rejected: {rejection}"),
            None => format!("{} with score {:.2}", record.state, record.score.value),
        },
    }
}

/// Runs the reference and baseline candidates for every task.
pub struct TaskValidator {
    orchestrator: RunOrchestrator,
}

impl TaskValidator {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Validates `tasks`.
    ///
    /// # Errors
    ///
    /// Whatever the run itself fails with; failing checks are part of the report.
    pub async fn validate(&self, tasks: Vec<Task>) -> Result<ValidationReport, OrchestratorError> {
        let expected: Vec<(String, bool)> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.reference_patch.is_some()))
            .collect();
        let sources: Vec<Arc<dyn CandidateSource>> =
            vec![Arc::new(ReferenceSource), Arc::new(BaselineSource)];
        let summary = self.orchestrator.run(tasks, &sources).await?;

        let find = |task_id: &str, source: &str| {
            summary
                .records
                .iter()
                .find(|r| r.task.id == task_id && r.candidate.source == source)
        };

        let results: Vec<_> = expected
            .iter()
            .map(|(task_id, has_reference)| {
                let result = check_task(
                    task_id,
                    *has_reference,
                    find(task_id, "reference"),
                    find(task_id, "baseline"),
                );
                if !result.valid {
                    warn!(
                        task_id = %task_id,
                        summary = %result.summary,
                        "Task does not discriminate"
                    );
                }
                result
            })
            .collect();

        let report = ValidationReport {
            run_id: summary.run_id.clone(),
            run_dir: summary.run_dir.clone(),
            results,
        };
        info!(
            run_id = %report.run_id,
            tasks = report.results.len(),
            invalid = report.non_discriminating().len(),
            "Validation complete"
        );
        Ok(report)
    }
}
