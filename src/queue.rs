//! The operations handle: everything an operator-facing surface needs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sqlx::SqlitePool;

use crate::errors::{QueueError, Result};
use crate::job_spec::JobSpec;
use crate::schema::{Job, JobState, QueueStatus};
use crate::{config, storage, store};

/// Where the queue keeps its state on disk.
///
/// Both paths are explicit; nothing in the crate reads process-wide
/// defaults behind the caller's back.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// The SQLite database file.
    pub db_path: PathBuf,
    /// Directory for per-job stdout/stderr log files.
    pub log_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("queuectl.db"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// A durable job queue backed by a single SQLite file.
///
/// Cheap to clone; clones share the same connection pool. Worker pools
/// are started over a `Queue` via [`crate::Runner`].
#[derive(Debug, Clone)]
pub struct Queue {
    pool: SqlitePool,
    log_dir: PathBuf,
}

impl Queue {
    /// Open (creating if necessary) the database and log directory.
    ///
    /// Idempotent: the schema is created on first use and default
    /// config values are seeded only where absent.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        let pool = store::connect(&config.db_path).await?;
        std::fs::create_dir_all(&config.log_dir)?;
        Ok(Self {
            pool,
            log_dir: config.log_dir,
        })
    }

    /// Insert a new job in `pending` state and return the stored row.
    ///
    /// Fails with [`QueueError::DuplicateId`] if the id is taken and
    /// [`QueueError::InvalidArg`] if required fields are empty.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        storage::enqueue(&self.pool, &spec, &self.log_dir).await
    }

    /// Fetch one job by id.
    pub async fn job(&self, id: &str) -> Result<Job> {
        storage::get(&self.pool, id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_owned()))
    }

    /// List jobs, optionally filtered by state, at most `limit` rows
    /// (default 100). Deterministically ordered by priority, readiness
    /// time, then id.
    pub async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        storage::list(&self.pool, state, limit.unwrap_or(100)).await
    }

    /// Snapshot of per-state counts and active worker identities.
    pub async fn status(&self) -> Result<QueueStatus> {
        storage::counts(&self.pool).await
    }

    /// Jobs currently in the Dead Letter Queue.
    pub async fn dlq_list(&self) -> Result<Vec<Job>> {
        storage::list(&self.pool, Some(JobState::Dead), i64::MAX).await
    }

    /// Requeue one dead job with a reset attempt counter.
    pub async fn dlq_retry(&self, id: &str) -> Result<()> {
        storage::retry_from_dlq(&self.pool, id).await
    }

    /// Requeue every dead job. Returns how many were requeued.
    pub async fn dlq_retry_all(&self) -> Result<u64> {
        storage::retry_all_dlq(&self.pool).await
    }

    /// Read one config value, or `None` if the key was never stored.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        config::get(&self.pool, key).await
    }

    /// Read the full config table.
    pub async fn config_all(&self) -> Result<BTreeMap<String, String>> {
        config::all(&self.pool).await
    }

    /// Validate and store a config value. Takes effect for running
    /// workers within one poll interval.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        config::set(&self.pool, key, value).await
    }

    /// The underlying connection pool.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Directory that holds the per-job log files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}
