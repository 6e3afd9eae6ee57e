//! Execution jobs — script process spawning with timeout enforcement and
//! capped output capture.

use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::registry::ManifestRecord;

/// Maximum bytes retained per captured stream (64KB).
const MAX_CAPTURE: usize = 64 * 1024;

/// Lifecycle status of an execution job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Where a job ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOrigin {
    /// In the calling process (router fallback or direct CLI use).
    Local,
    /// Inside the daemon process, via the HTTP API.
    Daemon,
}

impl std::fmt::Display for ExecOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Daemon => write!(f, "daemon"),
        }
    }
}

/// One command invocation, from spawn to terminal state.
///
/// The terminal status is set exactly once by `run_script`; records are
/// immutable once appended to history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub status: JobStatus,
    pub origin: ExecOrigin,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Run a resolved script to completion under `timeout`.
///
/// On expiry the child gets a terminate signal, then a kill after
/// `grace`; the job's status becomes `Timeout`. Non-zero exits come back
/// as `Failed` results, not errors.
pub async fn run_script(
    record: &ManifestRecord,
    args: &[String],
    timeout: Duration,
    grace: Duration,
    origin: ExecOrigin,
) -> Result<ExecutionJob, ExecutionError> {
    if record.is_orphaned() {
        return Err(ExecutionError::OrphanedManifest {
            name: record.name.clone(),
            path: record.source_path.clone(),
        });
    }

    let (program, pre_args) =
        record
            .language
            .interpreter()
            .ok_or_else(|| ExecutionError::SpawnFailed {
                name: record.name.clone(),
                reason: format!("no interpreter for language {}", record.language),
            })?;

    let mut command = Command::new(program);
    command
        .args(pre_args)
        .arg(&record.source_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started_at = Utc::now();
    let clock = std::time::Instant::now();

    let mut child = command.spawn().map_err(|e| ExecutionError::SpawnFailed {
        name: record.name.clone(),
        reason: e.to_string(),
    })?;

    tracing::debug!(command = %record.name, program, timeout_secs = timeout.as_secs(), "Spawned job");

    // Drain both pipes concurrently with the wait so a chatty child can
    // never fill a pipe and deadlock against us.
    let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(e)) => {
            return Err(ExecutionError::SpawnFailed {
                name: record.name.clone(),
                reason: format!("wait failed: {e}"),
            });
        }
        Err(_) => {
            tracing::warn!(command = %record.name, timeout_secs = timeout.as_secs(),
                "Job exceeded timeout, terminating");
            terminate(&mut child, grace).await;
            None
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let finished_at = Utc::now();
    let duration_ms = clock.elapsed().as_millis() as u64;

    let (job_status, exit_code) = match status {
        Some(exit) if exit.success() => (JobStatus::Succeeded, exit.code()),
        Some(exit) => (JobStatus::Failed, exit.code()),
        None => (JobStatus::Timeout, None),
    };

    tracing::info!(
        command = %record.name,
        status = %job_status,
        exit_code = ?exit_code,
        duration_ms,
        "Job finished"
    );

    Ok(ExecutionJob {
        id: Uuid::new_v4(),
        command: record.name.clone(),
        args: args.to_vec(),
        status: job_status,
        origin,
        started_at,
        finished_at: Some(finished_at),
        stdout,
        stderr,
        exit_code,
        duration_ms,
    })
}

/// Graceful-then-forceful termination: SIGTERM, wait out the grace
/// period, then SIGKILL whatever is left.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "Child survived SIGTERM grace period, killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
}

/// Read a child stream to EOF, retaining at most `MAX_CAPTURE` bytes.
/// Always drains fully so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };

    let mut retained: Vec<u8> = Vec::new();
    let mut truncated = 0usize;
    let mut buf = [0u8; 8192];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let keep = (MAX_CAPTURE - retained.len().min(MAX_CAPTURE)).min(n);
                retained.extend_from_slice(&buf[..keep]);
                truncated += n - keep;
            }
            Err(_) => break,
        }
    }

    let mut out = String::from_utf8_lossy(&retained).into_owned();
    if truncated > 0 {
        out.push_str(&format!("\n... [truncated {truncated} bytes]"));
    }
    out
}
