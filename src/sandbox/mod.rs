//! Sandboxed command execution.
//!
//! Commands run as local processes in their own process group with CPU,
//! address-space and core-dump rlimits, a wall-clock timeout and capped
//! output capture.

pub mod executor;
pub mod limits;
pub mod output;
pub mod result;

pub use executor::{CommandExecutor, ProcessSandbox, SandboxCommand};
pub use limits::ResourceLimits;
pub use output::{read_capped, CapturedStream};
pub use result::{ExecutionResult, ExecutionSummary, ResourceOutcome};
