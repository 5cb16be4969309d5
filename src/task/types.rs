//! Task definition types.
//!
//! `TaskManifest` mirrors `task.yaml`; `Task` is the fully loaded, immutable
//! definition the rest of the engine works with.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::scoring::ScoringPolicy;

/// A file tree keyed by forward-slash relative path.
pub type FileTree = BTreeMap<String, Vec<u8>>;

/// Default marker a compiled test binary must print on success.
pub const DEFAULT_PASS_MARKER: &str = "ALL TESTS PASSED";

/// Verification strategy declared by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    CompiledTestBinary,
    ScriptedTestRunner,
    StaticPatternCheck,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::CompiledTestBinary => write!(f, "compiled_test_binary"),
            StrategyKind::ScriptedTestRunner => write!(f, "scripted_test_runner"),
            StrategyKind::StaticPatternCheck => write!(f, "static_pattern_check"),
        }
    }
}

/// Sanitizer a compiled harness is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sanitizer {
    Address,
    Undefined,
    Memory,
    Thread,
    Leak,
}

/// Whether a static pattern must be found or must be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    #[default]
    Present,
    Absent,
}

/// One static source check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternCheckSpec {
    /// File the check scans, relative to the working tree.
    pub file: String,
    /// Restrict the scan to the body of this function.
    #[serde(default)]
    pub function: Option<String>,
    /// Token pattern (`$name`, `$_`, `...`).
    pub pattern: String,
    #[serde(default)]
    pub expect: Expectation,
    #[serde(default)]
    pub description: Option<String>,
}

/// Harness descriptor from `task.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessSpec {
    pub strategy: StrategyKind,
    /// Build command run before the tests (compiled strategy).
    #[serde(default)]
    pub build: Option<String>,
    /// Test command.
    #[serde(default)]
    pub command: Option<String>,
    /// Wall-clock timeout per command; engine limits apply when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub sanitizer: Option<Sanitizer>,
    #[serde(default)]
    pub pass_marker: Option<String>,
    /// Custom summary regex with a `failed` named group (scripted strategy).
    #[serde(default)]
    pub summary_pattern: Option<String>,
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: Vec<PatternCheckSpec>,
}

fn default_samples() -> u32 {
    1
}

impl HarnessSpec {
    /// Checks that the descriptor is complete for its strategy.
    ///
    /// Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.samples == 0 {
            return Err("harness.samples must be at least 1".to_string());
        }
        if self.timeout_secs == Some(0) {
            return Err("harness.timeout_secs must be greater than 0".to_string());
        }
        if self.pass_marker.as_deref() == Some("") {
            return Err("harness.pass_marker must not be empty".to_string());
        }

        match self.strategy {
            StrategyKind::CompiledTestBinary | StrategyKind::ScriptedTestRunner => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(format!("strategy {} requires harness.command", self.strategy));
                }
            }
            StrategyKind::StaticPatternCheck => {
                if self.checks.is_empty() {
                    return Err("static_pattern_check requires at least one check".to_string());
                }
            }
        }

        if let Some(pattern) = &self.summary_pattern {
            let re = Regex::new(pattern)
                .map_err(|e| format!("harness.summary_pattern is not a valid regex: {e}"))?;
            if !re.capture_names().flatten().any(|name| name == "failed") {
                return Err("harness.summary_pattern needs a `failed` named group".to_string());
            }
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(format!("harness.env has an invalid variable name '{key}'"));
            }
        }

        Ok(())
    }

    /// The pass marker, falling back to the default.
    pub fn pass_marker(&self) -> &str {
        self.pass_marker.as_deref().unwrap_or(DEFAULT_PASS_MARKER)
    }
}

/// Policy name as written in `task.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    BinaryGate,
    Threshold,
}

/// Scoring section of `task.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringSpec {
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Whether `structure_matches` is computed against the reference patch.
    #[serde(default = "default_true")]
    pub structure: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ScoringSpec {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            threshold: None,
            structure: true,
        }
    }
}

impl ScoringSpec {
    /// Resolves the policy, using `default_threshold` when none is given.
    pub fn policy(&self, default_threshold: f64) -> ScoringPolicy {
        match self.policy {
            PolicyKind::BinaryGate => ScoringPolicy::BinaryGate,
            PolicyKind::Threshold => ScoringPolicy::Threshold {
                threshold: self.threshold.unwrap_or(default_threshold),
            },
        }
    }
}

/// Raw `task.yaml` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskManifest {
    pub id: String,
    pub category: String,
    pub engine: String,
    pub tier: u8,
    #[serde(default)]
    pub permitted_files: Option<Vec<String>>,
    /// Reference patch path relative to the task directory.
    #[serde(default)]
    pub reference_patch: Option<String>,
    pub harness: HarnessSpec,
    #[serde(default)]
    pub scoring: ScoringSpec,
}

/// A fully loaded task. Immutable once built.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub category: String,
    pub engine: String,
    /// Difficulty tier, 1-5.
    pub tier: u8,
    /// Problem statement shown to the candidate's author.
    pub prompt: String,
    pub starting_tree: FileTree,
    /// Files overlaid into the working tree after the patch.
    pub harness_files: FileTree,
    /// Paths (starting tree or harness) that carry an executable bit.
    pub executables: BTreeSet<String>,
    pub harness: HarnessSpec,
    pub reference_patch: Option<String>,
    pub permitted_files: Option<BTreeSet<String>>,
    pub scoring: ScoringSpec,
    /// SHA-256 over the task directory contents.
    pub digest: String,
    pub root: PathBuf,
}

impl Task {
    /// Strategy kind declared by the harness.
    pub fn strategy(&self) -> StrategyKind {
        self.harness.strategy
    }
}
