//! Compiled test binaries: build, run, look for sanitizer reports.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{run_samples, Verdict, Verification, VerificationDetail, VerifyContext};
use crate::error::SandboxError;
use crate::sandbox::{ExecutionResult, SandboxCommand};
use crate::task::HarnessSpec;

/// Prefixes of sanitizer diagnostics, in the order they are searched.
pub const SANITIZER_MARKERS: &[&str] = &[
    "==ERROR:",
    "ERROR: AddressSanitizer",
    "AddressSanitizer:",
    "ERROR: LeakSanitizer",
    "LeakSanitizer:",
    "UndefinedBehaviorSanitizer:",
    "runtime error:",
    "WARNING: MemorySanitizer",
    "MemorySanitizer:",
    "WARNING: ThreadSanitizer",
    "ThreadSanitizer:",
];

/// The compiled-strategy signals.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompiledSignals {
    pub compiles: Option<bool>,
    pub sanitizer_clean: Option<bool>,
    pub tests_pass: Option<bool>,
    /// First sanitizer marker seen, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitizer_finding: Option<String>,
}

/// Returns the first sanitizer marker in `text`.
pub fn sanitizer_diagnostic(text: &str) -> Option<&'static str> {
    SANITIZER_MARKERS.iter().copied().find(|m| text.contains(m))
}

/// Classifies a build result and the test samples that followed it.
///
/// `tests` is empty when the build failed and nothing ran.
pub fn classify(
    harness: &HarnessSpec,
    build: Option<&ExecutionResult>,
    tests: &[ExecutionResult],
) -> CompiledSignals {
    let compiles = build.map(ExecutionResult::succeeded);
    let ran = !tests.is_empty();

    let finding = tests.iter().find_map(|run| {
        sanitizer_diagnostic(&run.stderr_text())
            .or_else(|| sanitizer_diagnostic(&run.stdout_text()))
    });

    let sanitizer_clean = harness
        .sanitizer
        .map(|_| ran && finding.is_none());

    let marker = harness.pass_marker();
    let tests_pass = ran
        && tests
            .iter()
            .all(|run| run.succeeded() && run.stdout_text().contains(marker));

    CompiledSignals {
        compiles,
        sanitizer_clean,
        tests_pass: Some(tests_pass),
        sanitizer_finding: finding.map(str::to_string),
    }
}

/// Build once, then run the test binary `samples` times.
#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    harness: HarnessSpec,
    build: Option<SandboxCommand>,
    test: SandboxCommand,
}

impl CompiledStrategy {
    pub fn new(harness: &HarnessSpec, command: &str) -> Self {
        Self {
            harness: harness.clone(),
            build: harness
                .build
                .as_deref()
                .map(|b| SandboxCommand::new(b).with_env(&harness.env)),
            test: SandboxCommand::new(command).with_env(&harness.env),
        }
    }

    pub async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<Verification, SandboxError> {
        let limits = if self.harness.sanitizer.is_some() {
            ctx.limits.without_memory_cap()
        } else {
            ctx.limits
        };
        let mut executions = Vec::new();

        let build = match &self.build {
            Some(command) => {
                let result = ctx.executor.run(ctx.tree.path(), command, &limits, ctx.cancel).await?;
                if result.cancelled {
                    executions.push(result);
                    return Ok(cancelled(executions, 0));
                }
                Some(result)
            }
            None => None,
        };

        let built = build.as_ref().map_or(true, ExecutionResult::succeeded);
        let mut samples = Vec::new();
        if built {
            let marker = self.harness.pass_marker().to_string();
            let run = run_samples(ctx, &self.test, &limits, self.harness.samples, |r| {
                r.succeeded() && r.stdout_text().contains(&marker)
            })
            .await?;
            if run.cancelled {
                let sampled = run.runs.len() as u32;
                executions.extend(build);
                executions.extend(run.runs);
                return Ok(cancelled(executions, sampled));
            }
            samples = run.runs;
        } else {
            debug!("Build failed; test binary not run");
        }

        let signals = classify(&self.harness, build.as_ref(), &samples);
        let sample_count = samples.len() as u32;
        executions.extend(build);
        executions.extend(samples);

        Ok(Verification {
            verdict: Verdict {
                compiles: signals.compiles,
                sanitizer_clean: signals.sanitizer_clean,
                tests_pass: signals.tests_pass,
                structure_matches: None,
            },
            executions,
            samples: sample_count,
            cancelled: false,
            detail: VerificationDetail::CompiledTestBinary {
                sanitizer_finding: signals.sanitizer_finding,
            },
        })
    }
}

fn cancelled(executions: Vec<ExecutionResult>, samples: u32) -> Verification {
    Verification {
        verdict: Verdict::default(),
        samples,
        executions,
        cancelled: true,
        detail: VerificationDetail::CompiledTestBinary {
            sanitizer_finding: None,
        },
    }
}
