//! Scripted test runners: find the runner's summary line.
//!
//! Recognized forms, last one in the output wins:
//!
//! - pytest: `==== 3 passed, 1 failed in 0.12s ====`
//! - unittest: `Ran 4 tests in 0.01s` followed by `OK` or `FAILED (failures=1)`
//! - generic: `3 passed, 1 failed`
//! - a task-supplied regex with a `failed` (and optionally `passed`) group

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{run_samples, Verdict, Verification, VerificationDetail, VerifyContext};
use crate::error::SandboxError;
use crate::sandbox::{ExecutionResult, ResourceOutcome, SandboxCommand};
use crate::task::HarnessSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryFormat {
    Pytest,
    Unittest,
    Generic,
    Custom,
}

/// Counts reported by a runner's summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: u64,
    pub failed: u64,
    pub format: SummaryFormat,
}

impl TestSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.passed > 0
    }
}

fn pytest_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^=*\s*(?:\d+ \w+(?:, )?)+ in [\d.]+s(?: \([^)]*\))?\s*=*$")
            .expect("Invalid regex for pytest summary")
    })
}

fn count_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s+(passed|failed|failures?|errors?|error)\b")
            .expect("Invalid regex for result counts")
    })
}

fn unittest_ran() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Ran (\d+) tests? in ").expect("Invalid regex for unittest total")
    })
}

fn unittest_failed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(failures|errors|unexpected successes)=(\d+)")
            .expect("Invalid regex for unittest failures")
    })
}

/// Parses runner output into a [`TestSummary`].
#[derive(Debug, Clone, Default)]
pub struct SummaryParser {
    custom: Option<Regex>,
}

impl SummaryParser {
    /// Parser for the built-in formats, or for `pattern` alone when given.
    pub fn new(pattern: Option<&str>) -> Result<Self, String> {
        let custom = pattern
            .map(|p| Regex::new(p).map_err(|e| format!("invalid summary pattern: {e}")))
            .transpose()?;
        if let Some(re) = &custom {
            if !re.capture_names().flatten().any(|n| n == "failed") {
                return Err("summary pattern needs a `failed` named group".to_string());
            }
        }
        Ok(Self { custom })
    }

    /// Last summary in `stdout`, else the last in `stderr`.
    pub fn parse_result(&self, result: &ExecutionResult) -> Option<TestSummary> {
        self.parse(&result.stdout_text())
            .or_else(|| self.parse(&result.stderr_text()))
    }

    /// Last summary line in `output`.
    pub fn parse(&self, output: &str) -> Option<TestSummary> {
        match &self.custom {
            Some(re) => parse_custom(re, output),
            None => parse_builtin(output),
        }
    }
}

fn parse_custom(re: &Regex, output: &str) -> Option<TestSummary> {
    output
        .lines()
        .filter_map(|line| re.captures(line))
        .last()
        .and_then(|caps| {
            let failed: u64 = caps.name("failed")?.as_str().trim().parse().ok()?;
            let passed = caps
                .name("passed")
                .and_then(|m| m.as_str().trim().parse().ok())
                .unwrap_or(u64::from(failed == 0));
            Some(TestSummary {
                passed,
                failed,
                format: SummaryFormat::Custom,
            })
        })
}

fn parse_builtin(output: &str) -> Option<TestSummary> {
    let mut last = None;
    let mut unittest_total: Option<u64> = None;

    for raw in output.lines() {
        let line = raw.trim();

        if let Some(caps) = unittest_ran().captures(line) {
            unittest_total = caps.get(1).and_then(|m| m.as_str().parse().ok());
            continue;
        }
        if let Some(total) = unittest_total {
            if line.is_empty() {
                continue;
            }
            if line == "OK" || line.starts_with("OK (") {
                last = Some(TestSummary {
                    passed: total,
                    failed: 0,
                    format: SummaryFormat::Unittest,
                });
                unittest_total = None;
                continue;
            }
            if line.starts_with("FAILED (") {
                let failed: u64 = unittest_failed()
                    .captures_iter(line)
                    .filter_map(|c| c.get(2)?.as_str().parse::<u64>().ok())
                    .sum();
                last = Some(TestSummary {
                    passed: total.saturating_sub(failed),
                    failed,
                    format: SummaryFormat::Unittest,
                });
                unittest_total = None;
                continue;
            }
        }

        let mut passed = None;
        let mut failed = None;
        for caps in count_pair().captures_iter(line) {
            let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) else {
                continue;
            };
            let word = caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
            if word == "passed" {
                passed = Some(passed.unwrap_or(0) + n);
            } else {
                failed = Some(failed.unwrap_or(0) + n);
            }
        }
        if passed.is_some() || failed.is_some() {
            let format = if pytest_line().is_match(line) {
                SummaryFormat::Pytest
            } else {
                SummaryFormat::Generic
            };
            last = Some(TestSummary {
                passed: passed.unwrap_or(0),
                failed: failed.unwrap_or(0),
                format,
            });
        }
    }
    last
}

/// Whether a scripted run passed: it completed and its summary is clean.
pub fn sample_passes(result: &ExecutionResult, summary: Option<&TestSummary>) -> bool {
    result.outcome == ResourceOutcome::Completed && summary.is_some_and(TestSummary::is_clean)
}

/// Runs the test script `samples` times and reads its summary lines.
#[derive(Debug, Clone)]
pub struct ScriptedStrategy {
    test: SandboxCommand,
    samples: u32,
    parser: SummaryParser,
}

impl ScriptedStrategy {
    pub fn new(harness: &HarnessSpec, command: &str, parser: SummaryParser) -> Self {
        Self {
            test: SandboxCommand::new(command).with_env(&harness.env),
            samples: harness.samples,
            parser,
        }
    }

    pub async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<Verification, SandboxError> {
        let run = run_samples(ctx, &self.test, &ctx.limits, self.samples, |r| {
            sample_passes(r, self.parser.parse_result(r).as_ref())
        })
        .await?;

        let summaries: Vec<Option<TestSummary>> =
            run.runs.iter().map(|r| self.parser.parse_result(r)).collect();
        let tests_pass = !run.runs.is_empty()
            && run
                .runs
                .iter()
                .zip(&summaries)
                .all(|(r, s)| sample_passes(r, s.as_ref()));

        Ok(Verification {
            verdict: Verdict {
                tests_pass: (!run.cancelled).then_some(tests_pass),
                ..Verdict::default()
            },
            samples: run.runs.len() as u32,
            executions: run.runs,
            cancelled: run.cancelled,
            detail: VerificationDetail::ScriptedTestRunner { summaries },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(output: &str) -> Option<TestSummary> {
        SummaryParser::default().parse(output)
    }

    #[test]
    fn test_pytest_summary() {
        let out = "tests/test_ball.py ..F.\n=== FAILURES ===\n=========== 3 passed, 1 failed in 0.12s ===========\n";
        let summary = builtin(out).expect("summary");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.format, SummaryFormat::Pytest);
        assert!(!summary.is_clean());

        let quiet = builtin("....\n4 passed in 0.03s\n").expect("summary");
        assert!(quiet.is_clean());
        assert_eq!(quiet.format, SummaryFormat::Pytest);
    }

    #[test]
    fn test_pytest_errors_count_as_failures() {
        let summary = builtin("== 2 passed, 1 error in 0.40s ==").expect("summary");
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_unittest_summary() {
        let ok = "....\n----------------------------------------------------------------------\nRan 4 tests in 0.002s\n\nOK\n";
        let summary = builtin(ok).expect("summary");
        assert_eq!(summary.passed, 4);
        assert_eq!(summary.format, SummaryFormat::Unittest);
        assert!(summary.is_clean());

        let failed = "Ran 5 tests in 0.01s\n\nFAILED (failures=1, errors=1)\n";
        let summary = builtin(failed).expect("summary");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 2);
    }

    #[test]
    fn test_generic_summary_last_wins() {
        let out = "suite a: 2 passed, 1 failed\nsuite b rerun: 3 passed, 0 failed\n";
        let summary = builtin(out).expect("summary");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.format, SummaryFormat::Generic);
    }

    #[test]
    fn test_no_summary() {
        assert!(builtin("Traceback (most recent call last):\nImportError\n").is_none());
    }

    #[test]
    fn test_custom_pattern() {
        let parser = SummaryParser::new(Some(r"^RESULT ok=(?P<passed>\d+) bad=(?P<failed>\d+)$"))
            .expect("pattern");
        let summary = parser.parse("RESULT ok=7 bad=0\n").expect("summary");
        assert_eq!(summary.passed, 7);
        assert_eq!(summary.format, SummaryFormat::Custom);
        assert!(summary.is_clean());

        // Built-in forms are not consulted when a custom pattern is set.
        assert!(parser.parse("3 passed in 0.1s").is_none());
    }

    #[test]
    fn test_custom_pattern_requires_failed_group() {
        assert!(SummaryParser::new(Some(r"(\d+) bad")).is_err());
    }

    #[test]
    fn test_sample_requires_completion() {
        let mut result = ExecutionResult::synthetic("pytest");
        let summary = TestSummary {
            passed: 2,
            failed: 0,
            format: SummaryFormat::Pytest,
        };
        assert!(sample_passes(&result, Some(&summary)));
        result.outcome = ResourceOutcome::TimedOut;
        assert!(!sample_passes(&result, Some(&summary)));
        assert!(!sample_passes(&ExecutionResult::synthetic("x"), None));
    }

    mod strategy {
        use super::*;
        use crate::sandbox::ResourceLimits;
        use crate::task::{FileTree, StrategyKind};
        use crate::verification::testing::CannedExecutor;
        use crate::workspace::WorkingTree;
        use std::collections::{BTreeMap, BTreeSet};
        use tokio_util::sync::CancellationToken;

        fn harness(samples: u32) -> HarnessSpec {
            HarnessSpec {
                strategy: StrategyKind::ScriptedTestRunner,
                build: None,
                command: Some("python -m pytest -q".to_string()),
                timeout_secs: None,
                sanitizer: None,
                pass_marker: None,
                summary_pattern: None,
                samples,
                env: BTreeMap::new(),
                checks: Vec::new(),
            }
        }

        async fn verify(samples: u32, executor: &CannedExecutor) -> Verification {
            let tree = WorkingTree::materialize(
                "scripted",
                FileTree::new(),
                &FileTree::new(),
                &BTreeSet::new(),
            )
            .expect("tree");
            let cancel = CancellationToken::new();
            let ctx = VerifyContext {
                tree: &tree,
                executor,
                limits: ResourceLimits::default(),
                cancel: &cancel,
            };
            let parser = SummaryParser::default();
            ScriptedStrategy::new(&harness(samples), "python -m pytest -q", parser)
                .verify(&ctx)
                .await
                .expect("verify")
        }

        #[tokio::test]
        async fn test_all_samples_must_pass() {
            let executor =
                CannedExecutor::new(&[(0, "3 passed in 0.1s", ""), (0, "3 passed in 0.1s", "")]);
            let verification = verify(2, &executor).await;
            assert_eq!(verification.samples, 2);
            assert_eq!(verification.verdict.tests_pass, Some(true));
            assert_eq!(verification.verdict.compiles, None);
            assert_eq!(verification.verdict.sanitizer_clean, None);
        }

        #[tokio::test]
        async fn test_flaky_sample_fails() {
            let executor = CannedExecutor::new(&[
                (0, "3 passed in 0.1s", ""),
                (1, "2 passed, 1 failed in 0.1s", ""),
            ]);
            let verification = verify(3, &executor).await;
            assert_eq!(verification.samples, 2);
            assert_eq!(verification.verdict.tests_pass, Some(false));
        }

        #[tokio::test]
        async fn test_missing_summary_fails() {
            let executor =
                CannedExecutor::new(&[(0, "", "ModuleNotFoundError: No module named 'pygame'")]);
            let verification = verify(1, &executor).await;
            assert_eq!(verification.verdict.tests_pass, Some(false));
            match verification.detail {
                VerificationDetail::ScriptedTestRunner { summaries } => {
                    assert_eq!(summaries, vec![None])
                }
                other => panic!("unexpected detail {other:?}"),
            }
        }
    }
}
