//! Bounded worker pool that evaluates a run's jobs.
//!
//! One job per (task, candidate source) pair. Jobs are spawned onto a
//! `JoinSet` and gated by a semaphore sized from the configuration; stages
//! within a job run sequentially. Cancellation stops running executions
//! immediately and turns jobs that have not started into `Cancelled` records.
//!
//! # Features
//!
//! - Configurable number of concurrent jobs
//! - Retry of infrastructure errors up to a fixed budget
//! - One immutable record per job, written when it reaches a terminal state
//! - Pool statistics tracking

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{Job, JobState};
use crate::candidate::{label_slug, CandidateSource, Provenance};
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, SandboxError, StorageError};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::pipeline::{AttemptError, Evaluation, Evaluator, TaskPlan};
use crate::sandbox::{CommandExecutor, ProcessSandbox};
use crate::scoring::Score;
use crate::storage::{RunArtifactStore, RunManifest, RunRecord, TaskRef};
use crate::task::Task;

/// Statistics about a finished pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Maximum number of concurrent jobs.
    pub num_workers: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_infrastructure_error: u64,
    pub jobs_cancelled: u64,
    /// Attempts retried after an infrastructure error.
    pub retries: u64,
    /// Average wall time of jobs that started.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Jobs that reached any terminal state.
    pub fn total_processed(&self) -> u64 {
        self.jobs_succeeded
            + self.jobs_failed
            + self.jobs_infrastructure_error
            + self.jobs_cancelled
    }

    /// Share of evaluated jobs that passed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let evaluated = self.jobs_succeeded + self.jobs_failed;
        if evaluated == 0 {
            return 0.0;
        }
        (self.jobs_succeeded as f64 / evaluated as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_infrastructure_error: AtomicU64,
    jobs_cancelled: AtomicU64,
    retries: AtomicU64,
    started_jobs: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_infrastructure_error: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            started_jobs: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record_terminal(&self, state: JobState, duration: Option<Duration>) {
        let counter = match state {
            JobState::Succeeded => &self.jobs_succeeded,
            JobState::Failed => &self.jobs_failed,
            JobState::InfrastructureError => &self.jobs_infrastructure_error,
            JobState::Cancelled => &self.jobs_cancelled,
            JobState::Queued | JobState::Running => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(duration) = duration {
            self.started_jobs.fetch_add(1, Ordering::SeqCst);
            self.total_duration_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let started = self.started_jobs.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let average_job_duration = if started > 0 {
            Duration::from_millis(total_duration_ms / started)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            jobs_succeeded: self.jobs_succeeded.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_infrastructure_error: self.jobs_infrastructure_error.load(Ordering::SeqCst),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            average_job_duration,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub manifest: RunManifest,
    pub records: Vec<RunRecord>,
    pub stats: PoolStats,
    /// The run was cancelled before every job finished on its own.
    pub cancelled: bool,
}

impl RunSummary {
    /// Every job reached a terminal state other than `InfrastructureError`.
    pub fn all_evaluated(&self) -> bool {
        self.manifest.infrastructure_errors() == 0
    }
}

/// Runs every (task, candidate) job of a run.
pub struct RunOrchestrator {
    config: Arc<EngineConfig>,
    executor: Arc<dyn CommandExecutor>,
    output: PathBuf,
    cancel: CancellationToken,
    run_id: Option<String>,
    metrics: MetricsCollector,
}

impl RunOrchestrator {
    /// Creates an orchestrator that runs commands in a [`ProcessSandbox`].
    pub fn new(config: EngineConfig, output: impl Into<PathBuf>) -> Self {
        let executor = ProcessSandbox::new()
            .with_env_passthrough(config.env_passthrough.clone())
            .with_reap_grace(Duration::from_millis(config.reap_grace_ms));
        Self::with_executor(config, Arc::new(executor), output)
    }

    pub fn with_executor(
        config: EngineConfig,
        executor: Arc<dyn CommandExecutor>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            executor,
            output: output.into(),
            cancel: CancellationToken::new(),
            run_id: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Uses a fixed run id instead of a generated one.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Token that cancels the run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Resolves every task, then evaluates every (task, candidate) pair.
    ///
    /// # Errors
    ///
    /// - `OrchestratorError::Task` if any task is malformed; nothing runs
    /// - `OrchestratorError::Storage` if the run directory or a record cannot
    ///   be written
    /// - `OrchestratorError::WorkerPanicked` if a job task panicked
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        candidates: &[Arc<dyn CandidateSource>],
    ) -> Result<RunSummary, OrchestratorError> {
        if tasks.is_empty() {
            return Err(OrchestratorError::NoTasks);
        }
        if candidates.is_empty() {
            return Err(OrchestratorError::NoCandidates);
        }
        // Record ids use the slug, so two labels with one slug would collide.
        let mut slugs = BTreeSet::new();
        for source in candidates {
            if !slugs.insert(label_slug(source.label())) {
                return Err(OrchestratorError::DuplicateCandidate(
                    source.label().to_string(),
                ));
            }
        }

        let plans = tasks
            .into_iter()
            .map(|task| TaskPlan::new(task, &self.config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to initialize metrics");
        }

        let run_id = self.run_id.clone().unwrap_or_else(generate_run_id);
        let started_at = Utc::now();
        let store = RunArtifactStore::create(&self.output, &run_id).await?;
        let evaluator = Evaluator::new(Arc::clone(&self.executor), store.clone(), &self.config);
        let stats = Arc::new(SharedPoolStats::new());
        let semaphore = Arc::new(Semaphore::new(self.config.workers));

        info!(
            run_id = %run_id,
            tasks = plans.len(),
            candidates = candidates.len(),
            workers = self.config.workers,
            "Starting run"
        );

        let mut set = JoinSet::new();
        for plan in &plans {
            for source in candidates {
                let worker = JobWorker {
                    run_id: run_id.clone(),
                    plan: Arc::clone(plan),
                    source: Arc::clone(source),
                    evaluator: evaluator.clone(),
                    cancel: self.cancel.clone(),
                    stats: Arc::clone(&stats),
                    metrics: self.metrics.clone(),
                    max_retries: self.config.max_retries,
                };
                let semaphore = Arc::clone(&semaphore);
                set.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = worker.cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let record = worker.run(permit.is_some()).await;
                    drop(permit);
                    record
                });
            }
        }

        let mut records = Vec::new();
        let mut first_error: Option<OrchestratorError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => {
                    error!(run_id = %run_id, error = %e, "Failed to persist job record");
                    first_error.get_or_insert(OrchestratorError::Storage(e));
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Job task panicked");
                    first_error.get_or_insert(OrchestratorError::WorkerPanicked(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        let manifest = RunManifest::from_records(
            &run_id,
            started_at,
            plans.len(),
            labels.into_iter().collect(),
            &records,
        );
        store.write_manifest(&manifest).await?;
        store.write_metrics(&export_metrics()).await?;

        let stats = stats.to_pool_stats(self.config.workers);
        info!(
            run_id = %run_id,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            infrastructure_errors = stats.jobs_infrastructure_error,
            cancelled = stats.jobs_cancelled,
            "Run complete"
        );

        Ok(RunSummary {
            run_id,
            run_dir: store.run_dir().to_path_buf(),
            manifest,
            records,
            stats,
            cancelled: self.cancel.is_cancelled(),
        })
    }
}

/// `<utc timestamp>-<8 hex chars>`.
fn generate_run_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &uuid[..8])
}

/// Everything one job needs, moved into its task.
struct JobWorker {
    run_id: String,
    plan: Arc<TaskPlan>,
    source: Arc<dyn CandidateSource>,
    evaluator: Evaluator,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    max_retries: u32,
}

/// The last attempt of a job, as it goes into the record.
struct Finished {
    provenance: Option<Provenance>,
    evaluation: Option<Evaluation>,
}

impl JobWorker {
    /// Drives the job to a terminal state and writes its record.
    ///
    /// `admitted` is false when the run was cancelled while the job waited
    /// for a slot.
    async fn run(self, admitted: bool) -> Result<RunRecord, StorageError> {
        let task_id = self.plan.task.id.clone();
        let mut job = Job::new(&task_id, self.source.label(), self.max_retries);
        let mut finished = Finished {
            provenance: None,
            evaluation: None,
        };
        let started = Instant::now();

        if !admitted {
            self.cancel_queued(&mut job);
        }

        while job.state == JobState::Queued {
            if self.cancel.is_cancelled() {
                self.cancel_queued(&mut job);
                break;
            }
            if let Err(e) = job.begin_attempt() {
                error!(task_id = %task_id, error = %e, "Illegal job transition");
                break;
            }
            debug!(
                task_id = %task_id,
                candidate = %job.candidate,
                attempt = job.attempts,
                "Processing job"
            );

            self.metrics.inc_jobs_in_progress();
            let attempt = self.attempt().await;
            self.metrics.dec_jobs_in_progress();

            let next = match attempt {
                Ok((provenance, evaluation)) => {
                    let state = if evaluation.cancelled {
                        JobState::Cancelled
                    } else if evaluation.passed() {
                        JobState::Succeeded
                    } else {
                        JobState::Failed
                    };
                    finished = Finished {
                        provenance,
                        evaluation: Some(evaluation),
                    };
                    job.transition(state)
                }
                Err(e) => {
                    finished = Finished {
                        provenance: None,
                        evaluation: None,
                    };
                    let retrying = job.record_infrastructure_error(e.to_string());
                    match &retrying {
                        Ok(true) => {
                            warn!(
                                task_id = %task_id,
                                candidate = %job.candidate,
                                error = %e,
                                remaining_attempts = job.remaining_attempts(),
                                "Infrastructure error, retrying"
                            );
                            self.stats.record_retry();
                            self.metrics.record_retry();
                        }
                        Ok(false) => {
                            error!(
                                task_id = %task_id,
                                candidate = %job.candidate,
                                error = %e,
                                attempts = job.attempts,
                                "Infrastructure error, retries exhausted"
                            );
                        }
                        Err(_) => {}
                    }
                    retrying.map(|_| ())
                }
            };
            if let Err(e) = next {
                error!(task_id = %task_id, error = %e, "Illegal job transition");
                break;
            }
        }

        let duration = job.started_at.map(|_| started.elapsed());
        self.stats.record_terminal(job.state, duration);
        self.metrics
            .record_job(job.state, &self.plan.task.category, self.source.label());

        let record = self.record(&job, finished);
        self.evaluator.store().write_record(&record).await?;
        info!(
            task_id = %task_id,
            record_id = %record.record_id,
            state = %record.state,
            score = record.score.value,
            "Job finished"
        );
        Ok(record)
    }

    fn cancel_queued(&self, job: &mut Job) {
        if let Err(e) = job.transition(JobState::Cancelled) {
            error!(task_id = %job.task_id, error = %e, "Illegal job transition");
        }
    }

    /// One attempt: fetch the candidate, then evaluate it.
    async fn attempt(&self) -> Result<(Option<Provenance>, Evaluation), AttemptError> {
        let candidate = self
            .source
            .candidate_for(&self.plan.task)
            .await
            .map_err(|e| SandboxError::Candidate(e.to_string()))?;
        let evaluation = self
            .evaluator
            .evaluate(&self.plan, candidate.as_ref(), &self.cancel)
            .await?;
        Ok((candidate.map(|c| c.provenance), evaluation))
    }

    fn record(&self, job: &Job, finished: Finished) -> RunRecord {
        let candidate = finished.provenance.unwrap_or_else(|| Provenance {
            source: self.source.label().to_string(),
            model: None,
            timestamp: Utc::now(),
            path: None,
        });
        let finished_at: DateTime<Utc> = job.finished_at.unwrap_or_else(Utc::now);
        let infrastructure_error = (job.state == JobState::InfrastructureError)
            .then(|| job.infrastructure_errors.last().cloned())
            .flatten();

        let mut record = RunRecord {
            record_id: job.record_id(),
            run_id: self.run_id.clone(),
            task: TaskRef::from(self.plan.task.as_ref()),
            candidate,
            state: job.state,
            attempts: job.attempts,
            patch: None,
            applied_diff_blob: None,
            executions: Vec::new(),
            samples: 0,
            verdict: None,
            score: Score::zero(self.plan.policy),
            structure: None,
            detail: None,
            rejection: None,
            infrastructure_error,
            infrastructure_errors: job.infrastructure_errors.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at,
        };

        if let Some(evaluation) = finished.evaluation {
            record.patch = evaluation.patch;
            record.applied_diff_blob = evaluation.applied_diff_blob;
            record.executions = evaluation.executions;
            record.samples = evaluation.samples;
            record.verdict = evaluation.verdict;
            record.score = evaluation.score;
            record.structure = evaluation.structure;
            record.detail = evaluation.detail;
            record.rejection = evaluation.rejection;
        }
        record
    }
}
