//! CLI command definitions for fixbench.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::candidate::{parse_selector, CandidateSource};
use crate::config::EngineConfig;
use crate::scheduler::{RunOrchestrator, RunSummary};
use crate::task::{StrategyKind, TaskSelector, TaskStore};
use crate::validation::{TaskValidator, ValidationReport};

/// Default output directory for run artifacts.
const DEFAULT_OUTPUT_DIR: &str = "./runs";

/// Exit status of a run that was interrupted.
const EXIT_CANCELLED: u8 = 130;

/// Sandboxed evaluation of candidate fix patches against benchmark tasks.
#[derive(Parser)]
#[command(name = "fixbench")]
#[command(about = "Apply candidate patches to benchmark tasks, run their harnesses and score the results")]
#[command(version)]
#[command(
    long_about = "fixbench evaluates candidate patches against a directory of benchmark tasks.\n\nEach (task, candidate) job applies the patch to a fresh working tree, runs the task's harness in a sandboxed process group and writes a scored record.\n\nExample usage:\n  fixbench run --tasks ./tasks --candidates reference dir:./out@gpt --output ./runs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Evaluate candidate patches against the selected tasks.
    Run(RunArgs),

    /// Check that every selected task's reference passes and its baseline fails.
    Validate(ValidateArgs),

    /// List the selected tasks.
    #[command(alias = "ls")]
    List(ListArgs),
}

/// Task selection shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct SelectionArgs {
    /// Directory holding one subdirectory per task.
    #[arg(short = 't', long)]
    pub tasks: PathBuf,

    /// Only tasks of this engine (repeatable).
    #[arg(long)]
    pub engine: Vec<String>,

    /// Only tasks of this category (repeatable).
    #[arg(short = 'c', long)]
    pub category: Vec<String>,

    /// Only tasks of this difficulty tier (repeatable).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    pub tier: Vec<u8>,

    /// Only the task with this id (repeatable).
    #[arg(long = "task")]
    pub task_ids: Vec<String>,
}

impl SelectionArgs {
    fn selector(&self) -> TaskSelector {
        TaskSelector {
            engines: self.engine.clone(),
            categories: self.category.clone(),
            tiers: self.tier.clone(),
            task_ids: self.task_ids.clone(),
        }
    }
}

/// Engine settings shared by `run` and `validate`.
#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// Directory that receives one subdirectory per run.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// YAML engine configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of jobs evaluated concurrently.
    #[arg(short = 'w', long, env = "FIXBENCH_WORKERS")]
    pub workers: Option<usize>,

    /// Fixed run id instead of a generated one.
    #[arg(long)]
    pub run_id: Option<String>,
}

impl EngineArgs {
    /// Defaults, then the config file, then `FIXBENCH_*` variables, then flags.
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        let mut config = config.apply_env()?;
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        config.validate()?;
        Ok(config)
    }

    fn orchestrator(&self) -> anyhow::Result<RunOrchestrator> {
        let orchestrator = RunOrchestrator::new(self.engine_config()?, &self.output);
        Ok(match &self.run_id {
            Some(run_id) => orchestrator.with_run_id(run_id),
            None => orchestrator,
        })
    }
}

/// Arguments for `fixbench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Candidate sources: `reference`, `baseline` or `dir:<path>[@label]`.
    #[arg(long, num_args = 1.., required = true)]
    pub candidates: Vec<String>,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `fixbench validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Output JSON report.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `fixbench list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Errors (malformed tasks, bad configuration, unwritable output) surface as
/// `Err`; a completed command reports success or failure through the exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Validate(args) => run_validate_command(args).await,
        Commands::List(args) => run_list_command(args),
    }
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding jobs");
            token.cancel();
        }
    });
}

fn load_tasks(selection: &SelectionArgs) -> anyhow::Result<Vec<crate::task::Task>> {
    let store = TaskStore::open(&selection.tasks)
        .with_context(|| format!("Failed to open task directory {}", selection.tasks.display()))?;
    let tasks = store.load_selected(&selection.selector())?;
    if tasks.is_empty() {
        anyhow::bail!("No tasks match the selection under {}", selection.tasks.display());
    }
    info!(tasks = tasks.len(), root = %selection.tasks.display(), "Loaded tasks");
    Ok(tasks)
}

// ============================================================================
// run
// ============================================================================

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    status: &'static str,
    run_id: &'a str,
    run_dir: &'a Path,
    cancelled: bool,
    manifest: &'a crate::storage::RunManifest,
}

fn run_status(summary: &RunSummary) -> (&'static str, u8) {
    if summary.cancelled {
        ("cancelled", EXIT_CANCELLED)
    } else if summary.all_evaluated() {
        ("success", 0)
    } else {
        ("infrastructure_error", 1)
    }
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    let sources = args
        .candidates
        .iter()
        .map(|selector| parse_selector(selector))
        .collect::<Result<Vec<Arc<dyn CandidateSource>>, _>>()?;
    let tasks = load_tasks(&args.selection)?;
    let orchestrator = args.engine.orchestrator()?;
    cancel_on_ctrl_c(orchestrator.cancellation_token());

    let summary = orchestrator.run(tasks, &sources).await?;
    let (status, code) = run_status(&summary);

    if args.json {
        let output = RunOutput {
            status,
            run_id: &summary.run_id,
            run_dir: &summary.run_dir,
            cancelled: summary.cancelled,
            manifest: &summary.manifest,
        };
        let json_output = serde_json::to_string_pretty(&output)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_run_summary(&summary, status);
    }
    Ok(ExitCode::from(code))
}

fn print_run_summary(summary: &RunSummary, status: &str) {
    let manifest = &summary.manifest;
    println!("Run {} ({})", summary.run_id, status);
    println!("  artifacts: {}", summary.run_dir.display());
    println!(
        "  jobs: {}  passed: {}  failed: {}  rejected: {}  not evaluated: {}",
        manifest.totals.jobs,
        manifest.totals.passed,
        manifest.totals.failed,
        manifest.totals.rejected,
        manifest.totals.not_evaluated,
    );
    for (candidate, stats) in &manifest.by_candidate {
        let mean = stats
            .mean_score
            .map(|m| format!("{m:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} passed {}/{}  mean score {}",
            candidate,
            stats.passed,
            stats.evaluated(),
            mean
        );
    }
    for record in summary.records.iter().filter(|r| !r.evaluated()) {
        println!(
            "  could not evaluate {}: {}",
            record.record_id,
            record.infrastructure_error.as_deref().unwrap_or("cancelled")
        );
    }
}

// ============================================================================
// validate
// ============================================================================

async fn run_validate_command(args: ValidateArgs) -> anyhow::Result<ExitCode> {
    let tasks = load_tasks(&args.selection)?;
    let orchestrator = args.engine.orchestrator()?;
    let cancel = orchestrator.cancellation_token();
    cancel_on_ctrl_c(cancel.clone());

    let report = TaskValidator::new(orchestrator).validate(tasks).await?;

    if args.json {
        let json_output = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_validation_report(&report);
    }

    if cancel.is_cancelled() {
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    Ok(if report.all_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_validation_report(report: &ValidationReport) {
    for result in &report.results {
        let mark = if result.valid { "ok" } else { "FAIL" };
        println!("{:<4} {}  {}", mark, result.task_id, result.summary);
        for check in result.checks.iter().filter(|c| !c.passed) {
            println!(
                "       {}: {}",
                check.check_name,
                check.message.as_deref().unwrap_or("")
            );
        }
    }
    let invalid = report.non_discriminating();
    if invalid.is_empty() {
        println!("All {} tasks discriminate", report.results.len());
    } else {
        println!("Non-discriminating tasks: {}", invalid.join(", "));
    }
}

// ============================================================================
// list
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ListEntry {
    id: String,
    engine: String,
    category: String,
    tier: u8,
    strategy: StrategyKind,
    has_reference: bool,
}

fn list_entries(selection: &SelectionArgs) -> anyhow::Result<Vec<ListEntry>> {
    let store = TaskStore::open(&selection.tasks)
        .with_context(|| format!("Failed to open task directory {}", selection.tasks.display()))?;
    let selector = selection.selector();
    let mut entries = Vec::new();
    for id in store.list_task_ids()? {
        let manifest = store.load_manifest(&id)?;
        if !selector.matches(&manifest) {
            continue;
        }
        entries.push(ListEntry {
            id: manifest.id,
            engine: manifest.engine,
            category: manifest.category,
            tier: manifest.tier,
            strategy: manifest.harness.strategy,
            has_reference: manifest.reference_patch.is_some()
                || store.root().join(&id).join("reference.patch").is_file(),
        });
    }
    Ok(entries)
}

fn run_list_command(args: ListArgs) -> anyhow::Result<ExitCode> {
    let entries = list_entries(&args.selection)?;

    if args.json {
        let json_output = serde_json::to_string_pretty(&entries)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        for entry in &entries {
            println!(
                "{:<32} {:<12} {:<16} tier {}  {}{}",
                entry.id,
                entry.engine,
                entry.category,
                entry.tier,
                entry.strategy,
                if entry.has_reference { "" } else { "  (no reference)" }
            );
        }
        println!("{} tasks", entries.len());
    }
    Ok(ExitCode::SUCCESS)
}
