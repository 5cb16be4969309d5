//! Verification strategies.
//!
//! A task declares one strategy kind in `task.yaml`; [`VerificationStrategy::for_task`]
//! resolves it once, compiling patterns and regexes up front, and the
//! resolved strategy is then run against every candidate's working tree.
//! Each strategy turns its executions into a [`Verdict`] with pure
//! classification functions.

pub mod compiled;
pub mod lexer;
pub mod scripted;
pub mod static_check;
pub mod structure;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{SandboxError, TaskError};
use crate::sandbox::{CommandExecutor, ExecutionResult, ResourceLimits, SandboxCommand};
use crate::task::{StrategyKind, Task};
use crate::workspace::WorkingTree;

pub use compiled::{CompiledSignals, CompiledStrategy};
pub use scripted::{ScriptedStrategy, SummaryFormat, SummaryParser, TestSummary};
pub use static_check::{CheckOutcome, CompiledCheck, StaticStrategy, TokenPattern};
pub use structure::{ReferenceStructure, StructureMatch};

/// Verification sub-signals. `None` means the signal does not apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub compiles: Option<bool>,
    pub sanitizer_clean: Option<bool>,
    pub tests_pass: Option<bool>,
    pub structure_matches: Option<bool>,
}

/// Strategy-specific findings kept in the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum VerificationDetail {
    CompiledTestBinary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sanitizer_finding: Option<String>,
    },
    ScriptedTestRunner {
        summaries: Vec<Option<TestSummary>>,
    },
    StaticPatternCheck {
        checks: Vec<CheckOutcome>,
    },
}

/// Outcome of running a strategy against one working tree.
#[derive(Debug, Clone)]
pub struct Verification {
    pub verdict: Verdict,
    /// Every executor call, in order.
    pub executions: Vec<ExecutionResult>,
    /// Test samples actually run.
    pub samples: u32,
    /// Stopped by cancellation; the verdict is incomplete.
    pub cancelled: bool,
    pub detail: VerificationDetail,
}

/// What a strategy needs to run.
pub struct VerifyContext<'a> {
    pub tree: &'a WorkingTree,
    pub executor: &'a dyn CommandExecutor,
    pub limits: ResourceLimits,
    pub cancel: &'a CancellationToken,
}

/// A task's resolved verification strategy.
#[derive(Debug, Clone)]
pub enum VerificationStrategy {
    CompiledTestBinary(CompiledStrategy),
    ScriptedTestRunner(ScriptedStrategy),
    StaticPatternCheck(StaticStrategy),
}

impl VerificationStrategy {
    /// Resolves the task's declared strategy.
    ///
    /// # Errors
    ///
    /// `TaskError::Malformed` if a pattern or summary regex does not compile.
    pub fn for_task(task: &Task) -> Result<Self, TaskError> {
        let harness = &task.harness;
        let missing_command = || {
            TaskError::malformed(
                &task.id,
                format!("strategy {} requires harness.command", harness.strategy),
            )
        };

        let strategy = match harness.strategy {
            StrategyKind::CompiledTestBinary => {
                let command = harness.command.as_deref().ok_or_else(missing_command)?;
                VerificationStrategy::CompiledTestBinary(CompiledStrategy::new(harness, command))
            }
            StrategyKind::ScriptedTestRunner => {
                let command = harness.command.as_deref().ok_or_else(missing_command)?;
                let parser = SummaryParser::new(harness.summary_pattern.as_deref())
                    .map_err(|reason| TaskError::malformed(&task.id, reason))?;
                VerificationStrategy::ScriptedTestRunner(ScriptedStrategy::new(
                    harness, command, parser,
                ))
            }
            StrategyKind::StaticPatternCheck => {
                let checks = harness
                    .checks
                    .iter()
                    .map(CompiledCheck::compile)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|reason| TaskError::malformed(&task.id, reason))?;
                VerificationStrategy::StaticPatternCheck(StaticStrategy::new(checks))
            }
        };
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            VerificationStrategy::CompiledTestBinary(_) => StrategyKind::CompiledTestBinary,
            VerificationStrategy::ScriptedTestRunner(_) => StrategyKind::ScriptedTestRunner,
            VerificationStrategy::StaticPatternCheck(_) => StrategyKind::StaticPatternCheck,
        }
    }

    /// Runs the strategy against a prepared working tree.
    ///
    /// # Errors
    ///
    /// Only harness faults; failing builds and tests are part of the verdict.
    pub async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<Verification, SandboxError> {
        match self {
            VerificationStrategy::CompiledTestBinary(s) => s.verify(ctx).await,
            VerificationStrategy::ScriptedTestRunner(s) => s.verify(ctx).await,
            VerificationStrategy::StaticPatternCheck(s) => s.verify(ctx),
        }
    }
}

/// Test-command samples and whether the last one was cancelled.
pub(crate) struct Samples {
    pub runs: Vec<ExecutionResult>,
    pub cancelled: bool,
}

/// Runs `command` up to `samples` times, stopping at the first failing or
/// cancelled sample.
pub(crate) async fn run_samples(
    ctx: &VerifyContext<'_>,
    command: &SandboxCommand,
    limits: &ResourceLimits,
    samples: u32,
    passes: impl Fn(&ExecutionResult) -> bool,
) -> Result<Samples, SandboxError> {
    let mut runs = Vec::with_capacity(samples as usize);
    for _ in 0..samples.max(1) {
        let result = ctx
            .executor
            .run(ctx.tree.path(), command, limits, ctx.cancel)
            .await?;
        let cancelled = result.cancelled;
        let passed = passes(&result);
        runs.push(result);
        if cancelled {
            return Ok(Samples {
                runs,
                cancelled: true,
            });
        }
        if !passed {
            break;
        }
    }
    Ok(Samples {
        runs,
        cancelled: false,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{HarnessSpec, PatternCheckSpec, ScoringSpec};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    fn task(harness: HarnessSpec) -> Task {
        Task {
            id: "t-1".to_string(),
            category: "c".to_string(),
            engine: "e".to_string(),
            tier: 1,
            prompt: String::new(),
            starting_tree: BTreeMap::new(),
            harness_files: BTreeMap::new(),
            executables: BTreeSet::new(),
            harness,
            reference_patch: None,
            permitted_files: None,
            scoring: ScoringSpec::default(),
            digest: String::new(),
            root: PathBuf::from("/tmp"),
        }
    }

    fn harness(strategy: StrategyKind) -> HarnessSpec {
        HarnessSpec {
            strategy,
            build: None,
            command: Some("run".to_string()),
            timeout_secs: None,
            sanitizer: None,
            pass_marker: None,
            summary_pattern: None,
            samples: 1,
            env: BTreeMap::new(),
            checks: Vec::new(),
        }
    }

    #[test]
    fn test_strategy_resolved_from_kind() {
        for kind in [StrategyKind::CompiledTestBinary, StrategyKind::ScriptedTestRunner] {
            let strategy = VerificationStrategy::for_task(&task(harness(kind))).expect("resolve");
            assert_eq!(strategy.kind(), kind);
        }
    }

    #[test]
    fn test_bad_pattern_is_malformed_task() {
        let mut spec = harness(StrategyKind::StaticPatternCheck);
        spec.checks.push(PatternCheckSpec {
            file: "a.c".to_string(),
            function: None,
            pattern: "...".to_string(),
            expect: Default::default(),
            description: None,
        });
        let err = VerificationStrategy::for_task(&task(spec)).expect_err("should fail");
        assert!(matches!(err, TaskError::Malformed { .. }));
    }

    #[test]
    fn test_verdict_default_is_all_inapplicable() {
        let verdict = Verdict::default();
        assert!(verdict.compiles.is_none() && verdict.tests_pass.is_none());
        let json = serde_json::to_value(verdict).expect("serialize");
        assert!(json["structure_matches"].is_null());
    }
}
