//! Engine configuration.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `FIXBENCH_*` environment variables, then CLI flags. Every layer ends
//! with [`EngineConfig::validate`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sandbox::ResourceLimits;
use crate::scoring::ScoreWeights;

/// Default number of retries for infrastructure failures.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default pass threshold for tasks using the threshold policy.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.7;

/// Default share of reference tokens a candidate must reproduce.
pub const DEFAULT_STRUCTURE_THRESHOLD: f64 = 0.5;

/// Configuration for the evaluation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of jobs evaluated concurrently.
    pub workers: usize,
    /// Retries granted to a job that hit an infrastructure error.
    pub max_retries: u32,
    /// Default sandbox limits.
    pub limits: ResourceLimits,
    /// Per-tier limit overrides, keyed by difficulty tier.
    pub tier_limits: BTreeMap<u8, ResourceLimits>,
    /// Weights of the verdict sub-signals.
    pub weights: ScoreWeights,
    /// Threshold used by tasks that pick the threshold policy without a value.
    pub default_threshold: f64,
    /// Minimum share of reference tokens for `structure_matches`.
    pub structure_threshold: f64,
    /// Host environment variables passed through to sandboxed commands.
    pub env_passthrough: Vec<String>,
    /// Bytes of stdout/stderr kept inline in each record.
    pub excerpt_bytes: usize,
    /// How long to wait for output pipes after the process group is gone.
    pub reap_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers,
            max_retries: DEFAULT_MAX_RETRIES,
            limits: ResourceLimits::default(),
            tier_limits: BTreeMap::new(),
            weights: ScoreWeights::default(),
            default_threshold: DEFAULT_PASS_THRESHOLD,
            structure_threshold: DEFAULT_STRUCTURE_THRESHOLD,
            env_passthrough: Vec::new(),
            excerpt_bytes: 4096,
            reap_grace_ms: 2000,
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `FIXBENCH_MAX_RETRIES`: infrastructure retry budget
    /// - `FIXBENCH_WALL_CLOCK_SECS`: default wall-clock timeout
    /// - `FIXBENCH_MEMORY_MB`: default memory cap (`0` disables it)
    /// - `FIXBENCH_ENV_PASSTHROUGH`: comma-separated variable names
    ///
    /// `FIXBENCH_WORKERS` is read by the CLI flag itself.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("FIXBENCH_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "FIXBENCH_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("FIXBENCH_WALL_CLOCK_SECS") {
            let secs: u64 = parse_env_value(&val, "FIXBENCH_WALL_CLOCK_SECS")?;
            self.limits = self.limits.with_wall_clock_secs(secs);
        }

        if let Ok(val) = std::env::var("FIXBENCH_MEMORY_MB") {
            let mb: u64 = parse_env_value(&val, "FIXBENCH_MEMORY_MB")?;
            self.limits.max_memory_mb = (mb > 0).then_some(mb);
        }

        if let Ok(val) = std::env::var("FIXBENCH_ENV_PASSTHROUGH") {
            self.env_passthrough = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        self.validate()?;
        Ok(self)
    }

    /// Limits for a task of the given tier, narrowed by the task's own timeout.
    pub fn limits_for(&self, tier: u8, task_timeout_secs: Option<u64>) -> ResourceLimits {
        let base = self.tier_limits.get(&tier).copied().unwrap_or(self.limits);
        match task_timeout_secs {
            Some(secs) => base.with_wall_clock_secs(secs),
            None => base,
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "workers must be greater than 0".to_string(),
            ));
        }

        if !self.weights.is_normalized() {
            return Err(ConfigError::Invalid(format!(
                "score weights must be non-negative and sum to 1.0 (got {})",
                self.weights.total()
            )));
        }

        if !(0.0..=1.0).contains(&self.default_threshold) {
            return Err(ConfigError::Invalid(
                "default_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.structure_threshold) {
            return Err(ConfigError::Invalid(
                "structure_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        for (tier, limits) in std::iter::once((&0u8, &self.limits)).chain(self.tier_limits.iter()) {
            if limits.wall_clock_secs == 0 || limits.cpu_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "limits for tier {tier}: timeouts must be greater than 0"
                )));
            }
            if limits.max_output_bytes == 0 {
                return Err(ConfigError::Invalid(format!(
                    "limits for tier {tier}: max_output_bytes must be greater than 0"
                )));
            }
        }

        if self.tier_limits.keys().any(|tier| !(1..=5).contains(tier)) {
            return Err(ConfigError::Invalid(
                "tier_limits keys must be tiers 1-5".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the infrastructure retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the default limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Helper function to parse environment variable values.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}={value}: {e}")))
}
