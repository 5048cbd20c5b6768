//! Subprocess harness: runs one attempt of one job.
//!
//! The command is spawned through the host shell in its own process
//! group so a timeout can signal the entire subtree. Stdout and stderr
//! are wired straight into the job's log files. The executor never
//! touches the job row; the worker applies the resulting transition.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::logs;
use crate::schema::Job;
use crate::util;

/// Pause between SIGTERM and SIGKILL once a deadline fires.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command exited 0.
    Ok,
    /// The command exited with a non-zero code (or died to a signal).
    Nonzero,
    /// The wall-clock deadline fired and the process tree was killed.
    Timeout,
    /// The command never started.
    SpawnError,
}

/// What one attempt produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Outcome tag driving the retry state machine.
    pub outcome: Outcome,
    /// Exit code, when the process ran to an observable exit.
    pub exit_code: Option<i64>,
    /// Short diagnostic recorded as `last_error` on failure.
    pub message: Option<String>,
}

impl ExecutionResult {
    /// True when the attempt should be recorded as a success.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Ok
    }

    fn failure(outcome: Outcome, exit_code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            outcome,
            exit_code,
            message: Some(message.into()),
        }
    }
}

/// Run one attempt of `job` and report how it went.
pub(crate) async fn execute(job: &Job) -> ExecutionResult {
    let attempt = job.attempts + 1;
    let started_at = util::now();

    let stdout = logs::open_attempt(Path::new(&job.stdout_path), attempt, started_at);
    let stderr = logs::open_attempt(Path::new(&job.stderr_path), attempt, started_at);
    let (stdout, stderr) = match (stdout, stderr) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(error), _) | (_, Err(error)) => {
            return ExecutionResult::failure(
                Outcome::SpawnError,
                None,
                format!("failed to open log files: {error}"),
            );
        }
    };

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            warn!(job.id = %job.id, %error, "failed to spawn command");
            return ExecutionResult::failure(
                Outcome::SpawnError,
                None,
                format!("failed to spawn command: {error}"),
            );
        }
    };

    let status = match job.timeout_seconds {
        Some(seconds) => {
            let deadline = Duration::from_secs(seconds.unsigned_abs());
            match timeout(deadline, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    debug!(job.id = %job.id, seconds, "deadline fired, killing process group");
                    kill_process_tree(&mut child).await;
                    return ExecutionResult::failure(
                        Outcome::Timeout,
                        None,
                        format!("timed out after {seconds} seconds"),
                    );
                }
            }
        }
        None => child.wait().await,
    };

    match status {
        Ok(status) => match status.code() {
            Some(0) => ExecutionResult {
                outcome: Outcome::Ok,
                exit_code: Some(0),
                message: None,
            },
            Some(code) => ExecutionResult::failure(
                Outcome::Nonzero,
                Some(i64::from(code)),
                format!("command exited with code {code}"),
            ),
            None => ExecutionResult::failure(Outcome::Nonzero, None, "terminated by signal"),
        },
        Err(error) => ExecutionResult::failure(
            Outcome::SpawnError,
            None,
            format!("failed waiting on command: {error}"),
        ),
    }
}

/// SIGTERM the child's process group, allow [`KILL_GRACE`] for cleanup,
/// then SIGKILL whatever is left. Always reaps the child.
#[cfg(unix)]
async fn kill_process_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if killpg(group, Signal::SIGTERM).is_ok() && timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }

    if let Err(error) = killpg(group, Signal::SIGKILL) {
        warn!(%error, pid, "failed to kill process group");
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn kill_process_tree(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
