//! Process sandbox: runs one shell command under resource limits.
//!
//! Each command gets its own process group, a scrubbed environment, closed
//! stdin and `RLIMIT_CPU` / `RLIMIT_AS` / `RLIMIT_CORE` applied between fork
//! and exec. Whatever happens (normal exit, timeout, cancellation) the whole
//! group is SIGKILLed before the call returns, so nothing outlives it.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::limits::ResourceLimits;
use super::output::{read_capped_into, CapturedStream, SharedCapture};
use super::result::{ExecutionResult, ResourceOutcome};
use crate::error::SandboxError;

/// Fallback `PATH` when the host has none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Stderr markers that mean the process ran out of memory.
const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "Cannot allocate memory",
    "std::bad_alloc",
    "MemoryError",
    "out of memory",
    "failed to allocate",
    "allocation failed",
];

/// A command to run inside a working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCommand {
    /// Script passed to `/bin/sh -c`.
    pub script: String,
    /// Extra environment on top of the scrubbed base.
    pub env: BTreeMap<String, String>,
}

impl SandboxCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Runs commands in a working directory.
///
/// Implementations return exactly one result per call; `Err` is reserved for
/// faults of the harness itself, never for a failing command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        working_dir: &Path,
        command: &SandboxCommand,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;
}

/// Executor backed by local processes.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    env_passthrough: Vec<String>,
    reap_grace: Duration,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self {
            env_passthrough: Vec::new(),
            reap_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host variables copied into every command's environment.
    pub fn with_env_passthrough(mut self, names: Vec<String>) -> Self {
        self.env_passthrough = names;
        self
    }

    /// How long to wait for output pipes to close after the group is killed.
    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    fn build_command(
        &self,
        working_dir: &Path,
        command: &SandboxCommand,
        limits: &ResourceLimits,
    ) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&command.script)
            .current_dir(working_dir)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            )
            .env("HOME", working_dir)
            .env("TMPDIR", working_dir)
            .env("LANG", "C")
            .env("LC_ALL", "C");

        for name in &self.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        cmd.envs(&command.env);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            let plan = RlimitPlan::from_limits(limits);
            // SAFETY: the closure only calls async-signal-safe getrlimit/setrlimit.
            unsafe {
                cmd.pre_exec(move || plan.apply());
            }
        }
        #[cfg(not(unix))]
        let _ = limits;

        cmd
    }
}

/// Why the wait loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CommandExecutor for ProcessSandbox {
    async fn run(
        &self,
        working_dir: &Path,
        command: &SandboxCommand,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if !working_dir.is_dir() {
            return Err(SandboxError::WorkingDirMissing(working_dir.to_path_buf()));
        }

        let mut cmd = self.build_command(working_dir, command, limits);
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command.script.clone(),
            source,
        })?;
        let pgid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            kill_group(pgid);
            let _ = child.wait().await;
            return Err(SandboxError::Pipe("child output pipes missing".to_string()));
        };
        let cap = limits.max_output_bytes;
        let stdout_capture = SharedCapture::default();
        let stderr_capture = SharedCapture::default();
        let stdout_task = tokio::spawn(read_capped_into(stdout, cap, stdout_capture.clone()));
        let stderr_task = tokio::spawn(read_capped_into(stderr, cap, stderr_capture.clone()));

        let (termination, waited) = tokio::select! {
            status = child.wait() => (Termination::Exited, Some(status)),
            _ = tokio::time::sleep(limits.wall_clock()) => (Termination::TimedOut, None),
            _ = cancel.cancelled() => (Termination::Cancelled, None),
        };

        // Kills the command on timeout/cancel and any stragglers after a normal exit.
        kill_group(pgid);

        let status = match waited {
            Some(status) => status,
            None => child.wait().await,
        }
        .map_err(SandboxError::Wait)?;
        let duration = start.elapsed();

        let stdout = self.collect(stdout_task, &stdout_capture).await?;
        let stderr = self.collect(stderr_task, &stderr_capture).await?;

        let outcome = classify_outcome(&status, termination, limits, &stderr);
        let result = ExecutionResult {
            command: command.script.clone(),
            exit_code: status.code(),
            signal: exit_signal(&status),
            stdout,
            stderr,
            duration,
            outcome,
            cancelled: termination == Termination::Cancelled,
        };

        debug!(
            command = %command.script,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            outcome = %result.outcome,
            duration_ms = duration.as_millis() as u64,
            "Sandboxed command finished"
        );
        Ok(result)
    }
}

impl ProcessSandbox {
    /// Joins an output reader, giving up after the reap grace.
    ///
    /// A process that escaped the group can hold a pipe open forever; the
    /// output read until then is kept and reported as truncated.
    async fn collect(
        &self,
        task: JoinHandle<std::io::Result<()>>,
        capture: &SharedCapture,
    ) -> Result<CapturedStream, SandboxError> {
        let abort = task.abort_handle();
        match tokio::time::timeout(self.reap_grace, task).await {
            Ok(Ok(Ok(()))) => Ok(capture.snapshot()),
            Ok(Ok(Err(e))) => Err(SandboxError::Pipe(e.to_string())),
            Ok(Err(e)) => Err(SandboxError::Pipe(format!("output reader failed: {e}"))),
            Err(_) => {
                abort.abort();
                warn!("Output pipe still open after the process group was killed");
                let mut partial = capture.snapshot();
                partial.truncated = true;
                Ok(partial)
            }
        }
    }
}

/// Maps an exit status to a resource outcome.
fn classify_outcome(
    status: &ExitStatus,
    termination: Termination,
    limits: &ResourceLimits,
    stderr: &CapturedStream,
) -> ResourceOutcome {
    if termination != Termination::Exited {
        return ResourceOutcome::TimedOut;
    }

    let allocation_failure = limits.has_memory_cap() && {
        let text = stderr.to_string_lossy();
        ALLOCATION_FAILURE_MARKERS.iter().any(|m| text.contains(m))
    };

    match exit_signal(status) {
        Some(libc::SIGXCPU) => ResourceOutcome::TimedOut,
        // We only send SIGKILL after the wait loop; one seen here came from elsewhere.
        Some(libc::SIGKILL) if limits.has_memory_cap() => ResourceOutcome::OomKilled,
        Some(_) if allocation_failure => ResourceOutcome::OomKilled,
        Some(_) => ResourceOutcome::SignalTerminated,
        None if allocation_failure && status.code() != Some(0) => ResourceOutcome::OomKilled,
        None => ResourceOutcome::Completed,
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else { return };
    let Ok(pgid) = libc::pid_t::try_from(pgid) else { return };
    if pgid <= 1 {
        return;
    }
    // SAFETY: plain syscall; ESRCH just means the group is already gone.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid = pgid, error = %err, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

/// Limits applied in the child before exec. Plain integers only.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_secs: u64,
    address_space: Option<u64>,
}

#[cfg(unix)]
impl RlimitPlan {
    fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            cpu_secs: limits.cpu_secs,
            address_space: limits.memory_bytes(),
        }
    }

    /// Applies the plan; never raises a limit above the inherited hard limit.
    fn apply(self) -> std::io::Result<()> {
        macro_rules! set_limit {
            ($resource:expr, $soft:expr, $hard:expr) => {{
                let mut current = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                // SAFETY: valid pointer to a local rlimit.
                if unsafe { libc::getrlimit($resource, &mut current) } != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let hard = ($hard as libc::rlim_t).min(current.rlim_max);
                let soft = ($soft as libc::rlim_t).min(hard);
                let limit = libc::rlimit {
                    rlim_cur: soft,
                    rlim_max: hard,
                };
                // SAFETY: valid pointer to a local rlimit.
                if unsafe { libc::setrlimit($resource, &limit) } != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }};
        }

        // SIGXCPU at the soft limit, SIGKILL one second later.
        set_limit!(libc::RLIMIT_CPU, self.cpu_secs, self.cpu_secs.saturating_add(1));
        if let Some(bytes) = self.address_space {
            set_limit!(libc::RLIMIT_AS, bytes, bytes);
        }
        set_limit!(libc::RLIMIT_CORE, 0u64, 0u64);
        Ok(())
    }
}
