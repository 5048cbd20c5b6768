//! Database row types for the job table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a job.
///
/// A failed attempt that will retry is written back as `Pending`
/// directly; there is no persisted intermediate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed once `next_run_at` is due.
    Pending,
    /// Claimed by a worker; `locked_by`/`locked_at` are set.
    Processing,
    /// Terminal: the last attempt exited 0.
    Completed,
    /// Terminal: retries exhausted, or parked here by an operator.
    Dead,
}

impl JobState {
    /// The lowercase form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

/// A job record as stored in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Caller-supplied unique key.
    pub id: String,
    /// Shell command line executed on each attempt.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Dispatch priority; lower runs earlier.
    pub priority: i64,
    /// Completed attempts so far (success or failure).
    pub attempts: i64,
    /// Cap on retries after the first attempt; total runs is
    /// `max_retries + 1`.
    pub max_retries: i64,
    /// Wall-clock kill deadline per attempt, if any.
    pub timeout_seconds: Option<i64>,
    /// Earliest time the job is eligible for claim.
    pub next_run_at: DateTime<Utc>,
    /// Identity of the worker holding the claim.
    pub locked_by: Option<String>,
    /// When the claim was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Exit code of the last finished attempt.
    pub exit_code: Option<i64>,
    /// Diagnostic from the last failed attempt.
    pub last_error: Option<String>,
    /// Stdout log file; stable across attempts.
    pub stdout_path: String,
    /// Stderr log file; stable across attempts.
    pub stderr_path: String,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Last committed transition.
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of queue-wide counts, as reported by status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// All jobs, regardless of state.
    pub total: i64,
    /// Jobs waiting for dispatch.
    pub pending: i64,
    /// Jobs currently claimed by a worker.
    pub processing: i64,
    /// Jobs whose last attempt exited 0.
    pub completed: i64,
    /// Jobs in the Dead Letter Queue.
    pub dead: i64,
    /// Distinct worker identities holding a claim right now.
    pub workers_active: i64,
}
