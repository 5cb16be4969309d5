//! Single-attempt evaluation of one candidate against one task.
//!
//! Stages run strictly in order: prepare the working tree, verify, score,
//! persist output blobs. A rejected patch stops after the first stage with a
//! zero score and no execution.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::candidate::CandidatePatch;
use crate::config::EngineConfig;
use crate::error::{SandboxError, StorageError, TaskError};
use crate::metrics::MetricsCollector;
use crate::patch::{parse_patch, unified_diff, PatchRejected, PatchSummary};
use crate::sandbox::{CommandExecutor, ExecutionResult, ExecutionSummary, ResourceLimits};
use crate::scoring::{score, Score, ScoreWeights, ScoringPolicy};
use crate::storage::RunArtifactStore;
use crate::task::Task;
use crate::verification::{
    ReferenceStructure, StructureMatch, Verdict, VerificationDetail, VerificationStrategy,
    VerifyContext,
};
use crate::workspace::{PrepareError, WorkingTree};

/// Faults that make an attempt retryable.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Everything resolved about a task before any job runs.
///
/// Building a plan is where malformed tasks surface: a strategy that does not
/// resolve or a reference patch that does not parse fails the task up front.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub task: Arc<Task>,
    pub strategy: VerificationStrategy,
    /// Tokens the reference patch adds, for `structure_matches`.
    pub reference: Option<ReferenceStructure>,
    pub limits: ResourceLimits,
    pub policy: ScoringPolicy,
}

impl TaskPlan {
    pub fn new(task: Task, config: &EngineConfig) -> Result<Self, TaskError> {
        let strategy = VerificationStrategy::for_task(&task)?;

        let reference = match (&task.reference_patch, task.scoring.structure) {
            (Some(diff), true) => {
                let patch = parse_patch(diff)
                    .map_err(|e| TaskError::malformed(&task.id, format!("reference patch: {e}")))?;
                ReferenceStructure::from_patch(&patch)
            }
            _ => None,
        };

        let limits = config.limits_for(task.tier, task.harness.timeout_secs);
        let policy = task.scoring.policy(config.default_threshold);
        Ok(Self {
            task: Arc::new(task),
            strategy,
            reference,
            limits,
            policy,
        })
    }
}

/// Result of one attempt that ran to a verdict, a rejection or cancellation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub patch: Option<PatchSummary>,
    pub applied_diff_blob: Option<String>,
    pub executions: Vec<ExecutionSummary>,
    pub samples: u32,
    pub verdict: Option<Verdict>,
    pub score: Score,
    pub structure: Option<StructureMatch>,
    pub detail: Option<VerificationDetail>,
    pub rejection: Option<PatchRejected>,
    pub cancelled: bool,
}

impl Evaluation {
    fn rejected(rejection: PatchRejected, policy: ScoringPolicy) -> Self {
        Self {
            patch: None,
            applied_diff_blob: None,
            executions: Vec::new(),
            samples: 0,
            verdict: None,
            score: Score::zero(policy),
            structure: None,
            detail: None,
            rejection: Some(rejection),
            cancelled: false,
        }
    }

    pub fn passed(&self) -> bool {
        !self.cancelled && self.rejection.is_none() && self.score.pass
    }
}

/// Runs attempts against an executor and persists their output.
#[derive(Clone)]
pub struct Evaluator {
    executor: Arc<dyn CommandExecutor>,
    store: RunArtifactStore,
    weights: ScoreWeights,
    structure_threshold: f64,
    excerpt_bytes: usize,
    metrics: MetricsCollector,
}

impl Evaluator {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        store: RunArtifactStore,
        config: &EngineConfig,
    ) -> Self {
        Self {
            executor,
            store,
            weights: config.weights,
            structure_threshold: config.structure_threshold,
            excerpt_bytes: config.excerpt_bytes,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn store(&self) -> &RunArtifactStore {
        &self.store
    }

    /// Evaluates `candidate` against the plan's task.
    ///
    /// `None` means the source had no candidate for this task, which is a
    /// rejection like any other.
    ///
    /// # Errors
    ///
    /// Infrastructure faults only; every candidate-caused outcome is an
    /// `Evaluation`.
    pub async fn evaluate(
        &self,
        plan: &TaskPlan,
        candidate: Option<&CandidatePatch>,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, AttemptError> {
        let task_id = plan.task.id.as_str();
        let Some(candidate) = candidate else {
            self.metrics.record_rejection(&PatchRejected::NoCandidate);
            return Ok(Evaluation::rejected(PatchRejected::NoCandidate, plan.policy));
        };

        let tree = match self.prepare(plan, &candidate.diff).await? {
            Ok(tree) => tree,
            Err(rejection) => {
                debug!(task_id = %task_id, reason = %rejection, "Patch rejected");
                self.metrics.record_rejection(&rejection);
                return Ok(Evaluation::rejected(rejection, plan.policy));
            }
        };

        let ctx = VerifyContext {
            tree: &tree,
            executor: self.executor.as_ref(),
            limits: plan.limits,
            cancel,
        };
        let verification = plan.strategy.verify(&ctx).await?;
        for execution in &verification.executions {
            self.metrics.record_execution(execution);
        }

        let structure = plan
            .reference
            .as_ref()
            .map(|r| r.evaluate(&plan.task.starting_tree, tree.files()));
        let applied = unified_diff(&plan.task.starting_tree, tree.files());
        let patch = tree.summary().clone();
        if let Err(e) = tree.close() {
            warn!(task_id = %task_id, error = %e, "Failed to remove working tree");
        }

        let applied_diff_blob = if applied.is_empty() {
            None
        } else {
            Some(self.store.store_blob(applied.as_bytes()).await?)
        };
        let executions = self.summarize(&verification.executions).await?;

        if verification.cancelled {
            debug!(task_id = %task_id, "Verification cancelled");
            return Ok(Evaluation {
                patch: Some(patch),
                applied_diff_blob,
                executions,
                samples: verification.samples,
                verdict: None,
                score: Score::zero(plan.policy),
                structure: None,
                detail: None,
                rejection: None,
                cancelled: true,
            });
        }

        let mut verdict = verification.verdict;
        if plan.task.scoring.structure {
            verdict.structure_matches = structure.map(|m| m.reaches(self.structure_threshold));
        }
        let score = score(&verdict, plan.policy, &self.weights);
        self.metrics.record_score(score.value);

        debug!(
            task_id = %task_id,
            source = %candidate.provenance.source,
            score = score.value,
            pass = score.pass,
            "Candidate evaluated"
        );

        Ok(Evaluation {
            patch: Some(patch),
            applied_diff_blob,
            executions,
            samples: verification.samples,
            verdict: Some(verdict),
            score,
            structure,
            detail: Some(verification.detail),
            rejection: None,
            cancelled: false,
        })
    }

    /// Applies the diff and materializes the tree off the async runtime.
    ///
    /// The outer result is an infrastructure fault, the inner one a rejection.
    async fn prepare(
        &self,
        plan: &TaskPlan,
        diff: &str,
    ) -> Result<Result<WorkingTree, PatchRejected>, SandboxError> {
        let task = Arc::clone(&plan.task);
        let diff = diff.to_string();
        let prepared = tokio::task::spawn_blocking(move || WorkingTree::prepare(&task, &diff))
            .await
            .map_err(|e| SandboxError::Workspace(std::io::Error::other(e.to_string())))?;
        match prepared {
            Ok(tree) => Ok(Ok(tree)),
            Err(PrepareError::Rejected(rejection)) => Ok(Err(rejection)),
            Err(PrepareError::Io(e)) => Err(SandboxError::Workspace(e)),
        }
    }

    /// Record summaries, with full output kept as blobs when it did not fit
    /// in the excerpt.
    async fn summarize(
        &self,
        executions: &[ExecutionResult],
    ) -> Result<Vec<ExecutionSummary>, StorageError> {
        let mut summaries = Vec::with_capacity(executions.len());
        for execution in executions {
            let mut summary = execution.summary(self.excerpt_bytes);
            if execution.stdout.bytes.len() > self.excerpt_bytes {
                summary.stdout_blob = Some(self.store.store_blob(&execution.stdout.bytes).await?);
            }
            if execution.stderr.bytes.len() > self.excerpt_bytes {
                summary.stderr_blob = Some(self.store.store_blob(&execution.stderr.bytes).await?);
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Provenance;
    use crate::sandbox::ProcessSandbox;
    use crate::task::{
        Expectation, FileTree, HarnessSpec, PatternCheckSpec, ScoringSpec, StrategyKind,
    };
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const START: &str = "int clamp(int v, int hi) {\n    if (v > hi) return hi;\n    return v;\n}\n";

    const FIX: &str = "--- a/src/clamp.c\n+++ b/src/clamp.c\n@@ -1,4 +1,5 @@\n int clamp(int v, int hi) {\n+    if (v < 0) return 0;\n     if (v > hi) return hi;\n     return v;\n }\n";

    fn tree(files: &[(&str, &str)]) -> FileTree {
        files
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    fn static_task() -> Task {
        Task {
            id: "clamp-001".to_string(),
            category: "bounds_check".to_string(),
            engine: "julius".to_string(),
            tier: 1,
            prompt: String::new(),
            starting_tree: tree(&[("src/clamp.c", START)]),
            harness_files: FileTree::new(),
            executables: BTreeSet::new(),
            harness: HarnessSpec {
                strategy: StrategyKind::StaticPatternCheck,
                build: None,
                command: None,
                timeout_secs: None,
                sanitizer: None,
                pass_marker: None,
                summary_pattern: None,
                samples: 1,
                env: BTreeMap::new(),
                checks: vec![PatternCheckSpec {
                    file: "src/clamp.c".to_string(),
                    function: Some("clamp".to_string()),
                    pattern: "if ( $v < 0 )".to_string(),
                    expect: Expectation::Present,
                    description: None,
                }],
            },
            reference_patch: Some(FIX.to_string()),
            permitted_files: None,
            scoring: ScoringSpec::default(),
            digest: String::new(),
            root: PathBuf::from("/tmp"),
        }
    }

    fn candidate(diff: &str) -> CandidatePatch {
        CandidatePatch {
            diff: diff.to_string(),
            provenance: Provenance {
                source: "test".to_string(),
                model: None,
                timestamp: Utc::now(),
                path: None,
            },
        }
    }

    async fn evaluator(dir: &TempDir) -> Evaluator {
        let store = RunArtifactStore::create(dir.path(), "run").await.expect("store");
        Evaluator::new(Arc::new(ProcessSandbox::new()), store, &EngineConfig::default())
    }

    #[tokio::test]
    async fn test_reference_passes_static_task() {
        let dir = TempDir::new().expect("tempdir");
        let plan = TaskPlan::new(static_task(), &EngineConfig::default()).expect("plan");
        let evaluation = evaluator(&dir)
            .await
            .evaluate(&plan, Some(&candidate(FIX)), &CancellationToken::new())
            .await
            .expect("evaluate");

        assert!(evaluation.passed());
        let verdict = evaluation.verdict.expect("verdict");
        assert_eq!(verdict.tests_pass, Some(true));
        assert_eq!(verdict.structure_matches, Some(true));
        assert_eq!(evaluation.score.value, 1.0);
        assert_eq!(evaluation.patch.expect("summary").lines_added, 1);
        assert!(evaluation.applied_diff_blob.is_some());
    }

    #[tokio::test]
    async fn test_baseline_fails_static_task() {
        let dir = TempDir::new().expect("tempdir");
        let plan = TaskPlan::new(static_task(), &EngineConfig::default()).expect("plan");
        let evaluation = evaluator(&dir)
            .await
            .evaluate(&plan, Some(&candidate("")), &CancellationToken::new())
            .await
            .expect("evaluate");

        assert!(!evaluation.passed());
        let verdict = evaluation.verdict.expect("verdict");
        assert_eq!(verdict.tests_pass, Some(false));
        assert_eq!(verdict.structure_matches, Some(false));
        assert_eq!(evaluation.structure.expect("structure").matched, 0);
        assert!(evaluation.applied_diff_blob.is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_hunk_is_rejected_without_execution() {
        let dir = TempDir::new().expect("tempdir");
        let plan = TaskPlan::new(static_task(), &EngineConfig::default()).expect("plan");
        let bad = "--- a/src/clamp.c\n+++ b/src/clamp.c\n@@ -50,1 +50,1 @@\n-nothing\n+something\n";
        let evaluation = evaluator(&dir)
            .await
            .evaluate(&plan, Some(&candidate(bad)), &CancellationToken::new())
            .await
            .expect("evaluate");

        assert!(matches!(evaluation.rejection, Some(PatchRejected::ContextMismatch { .. })));
        assert_eq!(evaluation.score.value, 0.0);
        assert!(evaluation.executions.is_empty());
        assert!(evaluation.verdict.is_none());
    }

    #[tokio::test]
    async fn test_missing_candidate_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let plan = TaskPlan::new(static_task(), &EngineConfig::default()).expect("plan");
        let evaluation = evaluator(&dir)
            .await
            .evaluate(&plan, None, &CancellationToken::new())
            .await
            .expect("evaluate");
        assert_eq!(evaluation.rejection, Some(PatchRejected::NoCandidate));
        assert!(!evaluation.passed());
    }

    #[test]
    fn test_malformed_reference_fails_plan() {
        let mut task = static_task();
        task.reference_patch =
            Some("--- a/src/clamp.c\n+++ b/src/clamp.c\n@@ nonsense @@\n".to_string());
        let err = TaskPlan::new(task, &EngineConfig::default()).expect_err("malformed");
        assert!(matches!(err, TaskError::Malformed { .. }));
    }

    #[test]
    fn test_structure_disabled_skips_reference() {
        let mut task = static_task();
        task.scoring.structure = false;
        let plan = TaskPlan::new(task, &EngineConfig::default()).expect("plan");
        assert!(plan.reference.is_none());
    }

    #[tokio::test]
    async fn test_scripted_task_large_output_goes_to_blob() {
        let dir = TempDir::new().expect("tempdir");
        let mut task = static_task();
        task.harness.strategy = StrategyKind::ScriptedTestRunner;
        task.harness.checks.clear();
        task.harness.command = Some(
            "i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done; echo '3 passed in 0.01s'"
                .to_string(),
        );
        task.scoring.structure = false;

        let mut config = EngineConfig::default();
        config.excerpt_bytes = 64;
        config.limits = config.limits.with_wall_clock_secs(30);
        let store = RunArtifactStore::create(dir.path(), "run").await.expect("store");
        let evaluator = Evaluator::new(Arc::new(ProcessSandbox::new()), store.clone(), &config);
        let plan = TaskPlan::new(task, &config).expect("plan");

        let evaluation = evaluator
            .evaluate(&plan, Some(&candidate("")), &CancellationToken::new())
            .await
            .expect("evaluate");
        assert!(evaluation.passed());
        let summary = &evaluation.executions[0];
        assert!(summary.stdout_excerpt.len() <= 64 + 3);
        let blob = summary.stdout_blob.as_deref().expect("blob");
        let full = store.read_blob(blob).await.expect("read");
        assert!(String::from_utf8_lossy(&full).contains("line-1999"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_yields_cancelled_evaluation() {
        let dir = TempDir::new().expect("tempdir");
        let mut task = static_task();
        task.harness.strategy = StrategyKind::ScriptedTestRunner;
        task.harness.checks.clear();
        task.harness.command = Some("sleep 30".to_string());
        let plan = TaskPlan::new(task, &EngineConfig::default()).expect("plan");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let evaluation = evaluator(&dir)
            .await
            .evaluate(&plan, Some(&candidate("")), &cancel)
            .await
            .expect("evaluate");
        assert!(evaluation.cancelled);
        assert!(!evaluation.passed());
    }
}
