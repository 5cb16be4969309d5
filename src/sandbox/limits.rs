//! Resource limits for sandboxed command execution.
//!
//! Limits are configuration, not constants: the engine config carries a
//! default set plus optional per-tier overrides, and a task's own harness
//! timeout narrows the wall clock further.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to a single sandboxed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock timeout in seconds before the process group is killed.
    pub wall_clock_secs: u64,
    /// CPU-time limit in seconds (`RLIMIT_CPU`).
    pub cpu_secs: u64,
    /// Address-space cap in megabytes (`RLIMIT_AS`), if any.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    /// Maximum bytes captured per output stream.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_secs: 300,
            cpu_secs: 240,
            max_memory_mb: Some(2048),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    /// Creates limits with the given wall clock and the default remaining values.
    pub fn new(wall_clock_secs: u64) -> Self {
        Self {
            wall_clock_secs,
            cpu_secs: wall_clock_secs,
            ..Default::default()
        }
    }

    /// Default limits scaled by difficulty tier (1-5).
    ///
    /// Unknown tiers fall back to the tier 3 values.
    pub fn for_tier(tier: u8) -> Self {
        let (wall, cpu, memory_mb) = match tier {
            1 => (120, 90, 1024),
            2 => (180, 150, 1536),
            4 => (600, 480, 3072),
            5 => (900, 720, 4096),
            _ => (300, 240, 2048),
        };
        Self {
            wall_clock_secs: wall,
            cpu_secs: cpu,
            max_memory_mb: Some(memory_mb),
            ..Default::default()
        }
    }

    /// Sets the wall-clock timeout; the CPU limit never exceeds it.
    pub fn with_wall_clock_secs(mut self, secs: u64) -> Self {
        self.wall_clock_secs = secs;
        self.cpu_secs = self.cpu_secs.min(secs);
        self
    }

    /// Sets the CPU-time limit.
    pub fn with_cpu_secs(mut self, secs: u64) -> Self {
        self.cpu_secs = secs;
        self
    }

    /// Sets the memory cap in MB.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    /// Removes the memory cap.
    ///
    /// Sanitizer runtimes reserve far more virtual memory than they use,
    /// so sanitizer builds run without `RLIMIT_AS`.
    pub fn without_memory_cap(mut self) -> Self {
        self.max_memory_mb = None;
        self
    }

    /// Sets the per-stream output cap.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Returns the wall-clock timeout.
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }

    /// Returns the memory cap in bytes.
    pub fn memory_bytes(&self) -> Option<u64> {
        self.max_memory_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Returns true if an address-space cap is active.
    pub fn has_memory_cap(&self) -> bool {
        self.max_memory_mb.is_some()
    }
}
