//! Job repository: every committed state transition goes through here.
//!
//! Transitions are single guarded UPDATE statements, so each row moves
//! through its lifecycle under serialised writes. The claim protocol is
//! the one critical section; see [`claim`].

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::config;
use crate::errors::{QueueError, Result};
use crate::job_spec::JobSpec;
use crate::logs;
use crate::schema::{Job, JobState, QueueStatus};
use crate::store::with_busy_retry;
use crate::util;

const JOB_COLUMNS: &str = "id, command, state, priority, attempts, max_retries, \
     timeout_seconds, next_run_at, locked_by, locked_at, exit_code, last_error, \
     stdout_path, stderr_path, created_at, updated_at";

/// How many compare-and-set rounds a single claim call may lose before
/// reporting the queue as empty. Keeps heavily contended pools from
/// livelocking on the same hot row.
const CLAIM_ROUNDS: u32 = 3;

/// Insert a new job in `pending` state.
///
/// `max_retries` falls back to the stored config default; `next_run_at`
/// to now. The job's log file pair is derived from its id once, here,
/// and stays stable for the life of the job.
pub(crate) async fn enqueue(pool: &SqlitePool, spec: &JobSpec, log_dir: &Path) -> Result<Job> {
    spec.validate()?;

    let max_retries = match spec.max_retries {
        Some(n) => i64::from(n),
        None => config::max_retries(pool).await?,
    };
    let now = util::now();
    let next_run_at = spec.run_at.unwrap_or(now);
    let (stdout_path, stderr_path) = logs::log_paths(log_dir, &spec.id);
    let stdout_path = stdout_path.display().to_string();
    let stderr_path = stderr_path.display().to_string();

    let inserted = with_busy_retry(|| {
        sqlx::query(
            "INSERT INTO jobs (id, command, state, priority, attempts, max_retries, \
             timeout_seconds, next_run_at, stdout_path, stderr_path, created_at, updated_at) \
             VALUES (?, ?, 'pending', ?, 0, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&spec.id)
        .bind(&spec.command)
        .bind(spec.priority.unwrap_or(0))
        .bind(max_retries)
        .bind(spec.timeout_seconds.map(i64::from))
        .bind(next_run_at)
        .bind(&stdout_path)
        .bind(&stderr_path)
        .bind(now)
        .bind(now)
        .execute(pool)
    })
    .await;

    match inserted {
        Ok(_) => {}
        Err(QueueError::Store(error)) if is_unique_violation(&error) => {
            return Err(QueueError::DuplicateId(spec.id.clone()));
        }
        Err(error) => return Err(error),
    }

    get(pool, &spec.id)
        .await?
        .ok_or_else(|| QueueError::NotFound(spec.id.clone()))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Fetch a single job by id.
pub(crate) async fn get(pool: &SqlitePool, id: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

/// List jobs, optionally filtered by state.
///
/// Ordered by `priority, next_run_at, id` so repeated calls over an
/// unchanged table return identical output.
pub(crate) async fn list(
    pool: &SqlitePool,
    state: Option<JobState>,
    limit: i64,
) -> Result<Vec<Job>> {
    let jobs = match state {
        Some(state) => {
            sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ? \
                 ORDER BY priority ASC, next_run_at ASC, id ASC LIMIT ?"
            ))
            .bind(state)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 ORDER BY priority ASC, next_run_at ASC, id ASC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(jobs)
}

/// Snapshot counts per state plus the number of distinct active workers.
pub(crate) async fn counts(pool: &SqlitePool) -> Result<QueueStatus> {
    let rows: Vec<(JobState, i64)> =
        sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .fetch_all(pool)
            .await?;

    let mut status = QueueStatus::default();
    for (state, count) in rows {
        status.total += count;
        match state {
            JobState::Pending => status.pending = count,
            JobState::Processing => status.processing = count,
            JobState::Completed => status.completed = count,
            JobState::Dead => status.dead = count,
        }
    }

    status.workers_active =
        sqlx::query_scalar("SELECT COUNT(DISTINCT locked_by) FROM jobs WHERE state = 'processing'")
            .fetch_one(pool)
            .await?;

    Ok(status)
}

/// Jobs that are not yet terminal. Drain mode exits only when this
/// reaches zero, so a failing job about to be rescheduled keeps the
/// pool alive.
pub(crate) async fn live_count(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'processing')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Atomically claim the next ready job for `worker_id`.
///
/// Each round selects the dispatch-ordered head and issues
/// `UPDATE ... WHERE id = ? AND state = 'pending'`; the state predicate
/// is the compare-and-set. Zero rows affected means another worker won
/// the row between our SELECT and UPDATE, so the round is retried with
/// a fresh SELECT, up to [`CLAIM_ROUNDS`] times. Returns `None` when no
/// eligible row exists (or contention exhausted the rounds).
pub(crate) async fn claim(
    pool: &SqlitePool,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    for _ in 0..CLAIM_ROUNDS {
        let mut tx = pool.begin().await?;

        let candidate: Option<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE state = 'pending' AND next_run_at <= ? \
             ORDER BY priority ASC, next_run_at ASC, id ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        let updated = match sqlx::query(
            "UPDATE jobs SET state = 'processing', locked_by = ?, locked_at = ?, \
             updated_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await
        {
            Ok(updated) => updated,
            // Under WAL a lost race can also surface as a busy error
            // when this transaction's snapshot cannot be upgraded for
            // the write. Treat it like rows-affected = 0.
            Err(error) if crate::store::is_busy(&error) => {
                tx.rollback().await?;
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        if updated.rows_affected() == 1 {
            let job = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Some(job));
        }

        // Lost the race for this row; rescan.
        tx.rollback().await?;
    }

    Ok(None)
}

/// Record a successful attempt: `processing -> completed`.
///
/// Returns `false` if the row was no longer held by `worker_id` (e.g.
/// a stale-lock sweep reclaimed it mid-run); the transition is then
/// skipped rather than clobbering someone else's state.
pub(crate) async fn finish_success(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    exit_code: i64,
) -> Result<bool> {
    let now = util::now();
    let result = with_busy_retry(|| {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', attempts = attempts + 1, exit_code = ?, \
             last_error = NULL, locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND state = 'processing' AND locked_by = ?",
        )
        .bind(exit_code)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(pool)
    })
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record a failed attempt that still has retries left:
/// `processing -> pending`, rescheduled `delay_seconds` into the future.
pub(crate) async fn finish_retry(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    exit_code: Option<i64>,
    error: &str,
    delay_seconds: i64,
) -> Result<bool> {
    let now = util::now();
    let next_run_at = now + Duration::seconds(delay_seconds);
    let result = with_busy_retry(|| {
        sqlx::query(
            "UPDATE jobs SET state = 'pending', attempts = attempts + 1, exit_code = ?, \
             last_error = ?, next_run_at = ?, locked_by = NULL, locked_at = NULL, \
             updated_at = ? WHERE id = ? AND state = 'processing' AND locked_by = ?",
        )
        .bind(exit_code)
        .bind(error)
        .bind(next_run_at)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(pool)
    })
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record a failed attempt with retries exhausted: `processing -> dead`.
pub(crate) async fn finish_dead(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    exit_code: Option<i64>,
    error: &str,
) -> Result<bool> {
    let now = util::now();
    let result = with_busy_retry(|| {
        sqlx::query(
            "UPDATE jobs SET state = 'dead', attempts = attempts + 1, exit_code = ?, \
             last_error = ?, locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND state = 'processing' AND locked_by = ?",
        )
        .bind(exit_code)
        .bind(error)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(pool)
    })
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Reset a dead job for a fresh round of attempts.
pub(crate) async fn retry_from_dlq(pool: &SqlitePool, id: &str) -> Result<()> {
    let job = get(pool, id)
        .await?
        .ok_or_else(|| QueueError::NotFound(id.to_owned()))?;
    if job.state != JobState::Dead {
        return Err(QueueError::InvalidState {
            id: id.to_owned(),
            actual: job.state.to_string(),
            expected: JobState::Dead.to_string(),
        });
    }

    let now = util::now();
    let result = with_busy_retry(|| {
        sqlx::query(
            "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = ?, \
             last_error = NULL, locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND state = 'dead'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
    })
    .await?;

    if result.rows_affected() == 0 {
        // The row changed state between the read and the update.
        warn!(job.id = id, "DLQ retry lost a race, job is no longer dead");
        return Err(QueueError::InvalidState {
            id: id.to_owned(),
            actual: String::from("unknown"),
            expected: JobState::Dead.to_string(),
        });
    }
    Ok(())
}

/// Reset every dead job. Returns the number of jobs requeued.
pub(crate) async fn retry_all_dlq(pool: &SqlitePool) -> Result<u64> {
    let now = util::now();
    let result = with_busy_retry(|| {
        sqlx::query(
            "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = ?, \
             last_error = NULL, locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE state = 'dead'",
        )
        .bind(now)
        .bind(now)
        .execute(pool)
    })
    .await?;
    Ok(result.rows_affected())
}

/// Release claims abandoned by dead workers.
///
/// Any `processing` row locked before `threshold` is treated as an
/// attempt that ran and never reported: the attempt counter is bumped,
/// and the row returns to `pending` — or goes straight to `dead` when
/// the bump exhausts its retries. Returns the number of rows reclaimed.
pub(crate) async fn recover_stale_locks(
    pool: &SqlitePool,
    threshold: DateTime<Utc>,
) -> Result<u64> {
    let now = util::now();
    let result = with_busy_retry(|| {
        sqlx::query(
            "UPDATE jobs SET \
             state = CASE WHEN attempts + 1 > max_retries THEN 'dead' ELSE 'pending' END, \
             attempts = attempts + 1, \
             last_error = 'lock expired, worker ' || COALESCE(locked_by, '?') || ' presumed dead', \
             locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE state = 'processing' AND locked_at < ?",
        )
        .bind(now)
        .bind(threshold)
        .execute(pool)
    })
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use chrono::Duration;
    use claims::{assert_none, assert_some};
    use tempfile::TempDir;

    async fn test_pool() -> (SqlitePool, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = store::connect(&dir.path().join("queue.db")).await.unwrap();
        (pool, dir)
    }

    async fn enqueue_simple(pool: &SqlitePool, dir: &TempDir, id: &str) -> Job {
        enqueue(pool, &JobSpec::new(id, "true"), dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn claim_locks_the_row_for_one_worker() {
        let (pool, dir) = test_pool().await;
        enqueue_simple(&pool, &dir, "solo").await;

        let now = util::now();
        let job = assert_some!(claim(&pool, "worker-a", now).await.unwrap());
        assert_eq!(job.id, "solo");
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
        assert_some!(job.locked_at);

        // The row is held; a second claim finds nothing.
        assert_none!(claim(&pool, "worker-b", now).await.unwrap());
    }

    #[tokio::test]
    async fn claim_respects_dispatch_order() {
        let (pool, dir) = test_pool().await;
        let at = util::now() - Duration::seconds(60);

        let urgent = JobSpec::new("urgent", "true").priority(-5).run_at(at);
        let casual = JobSpec::new("casual", "true").priority(10).run_at(at);
        let aardvark = JobSpec::new("aardvark", "true").priority(10).run_at(at);

        // Insertion order deliberately differs from dispatch order.
        enqueue(&pool, &casual, dir.path()).await.unwrap();
        enqueue(&pool, &urgent, dir.path()).await.unwrap();
        enqueue(&pool, &aardvark, dir.path()).await.unwrap();

        let now = util::now();
        let first = assert_some!(claim(&pool, "w", now).await.unwrap());
        assert_eq!(first.id, "urgent");
        // Equal priority and readiness: id breaks the tie.
        let second = assert_some!(claim(&pool, "w", now).await.unwrap());
        assert_eq!(second.id, "aardvark");
        let third = assert_some!(claim(&pool, "w", now).await.unwrap());
        assert_eq!(third.id, "casual");
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimable() {
        let (pool, dir) = test_pool().await;
        let spec = JobSpec::new("later", "true").run_at(util::now() + Duration::seconds(3600));
        enqueue(&pool, &spec, dir.path()).await.unwrap();

        assert_none!(claim(&pool, "w", util::now()).await.unwrap());

        // Once the clock passes next_run_at the job becomes eligible.
        let future_now = util::now() + Duration::seconds(3601);
        assert_some!(claim(&pool, "w", future_now).await.unwrap());
    }

    #[tokio::test]
    async fn finish_retry_reschedules_with_delay() {
        let (pool, dir) = test_pool().await;
        enqueue_simple(&pool, &dir, "wobbly").await;
        let job = assert_some!(claim(&pool, "w", util::now()).await.unwrap());

        let before = util::now();
        assert!(
            finish_retry(&pool, &job.id, "w", Some(1), "command exited with code 1", 4)
                .await
                .unwrap()
        );

        let job = get(&pool, "wobbly").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_none!(job.locked_by);
        assert_none!(job.locked_at);
        assert_eq!(job.exit_code, Some(1));
        assert_eq!(job.last_error.as_deref(), Some("command exited with code 1"));
        assert!(job.next_run_at >= before + Duration::seconds(4));
    }

    #[tokio::test]
    async fn finish_success_clears_diagnostics() {
        let (pool, dir) = test_pool().await;
        enqueue_simple(&pool, &dir, "steady").await;
        let job = assert_some!(claim(&pool, "w", util::now()).await.unwrap());
        assert!(finish_success(&pool, &job.id, "w", 0).await.unwrap());

        let job = get(&pool, "steady").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.exit_code, Some(0));
        assert_none!(job.last_error);
        assert_none!(job.locked_by);
    }

    #[tokio::test]
    async fn finish_is_skipped_when_the_claim_was_lost() {
        let (pool, dir) = test_pool().await;
        enqueue_simple(&pool, &dir, "contended").await;
        let job = assert_some!(claim(&pool, "w", util::now()).await.unwrap());

        // A sweep reclaims the row out from under the worker.
        let reclaimed = recover_stale_locks(&pool, util::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        assert!(!finish_success(&pool, &job.id, "w", 0).await.unwrap());
        let job = get(&pool, "contended").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn recovery_counts_the_abandoned_attempt() {
        let (pool, dir) = test_pool().await;
        enqueue_simple(&pool, &dir, "orphan").await;
        assert_some!(claim(&pool, "doomed-worker", util::now()).await.unwrap());

        let reclaimed = recover_stale_locks(&pool, util::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let job = get(&pool, "orphan").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("doomed-worker"));

        // Applied again immediately, the sweep is a no-op.
        let reclaimed = recover_stale_locks(&pool, util::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[tokio::test]
    async fn recovery_kills_a_job_with_no_retries_left() {
        let (pool, dir) = test_pool().await;
        let spec = JobSpec::new("last-chance", "true").max_retries(0);
        enqueue(&pool, &spec, dir.path()).await.unwrap();
        assert_some!(claim(&pool, "w", util::now()).await.unwrap());

        recover_stale_locks(&pool, util::now() + Duration::seconds(1))
            .await
            .unwrap();

        let job = get(&pool, "last-chance").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn finish_dead_preserves_the_diagnostic() {
        let (pool, dir) = test_pool().await;
        let spec = JobSpec::new("goner", "true").max_retries(0);
        enqueue(&pool, &spec, dir.path()).await.unwrap();
        let job = assert_some!(claim(&pool, "w", util::now()).await.unwrap());
        assert!(
            finish_dead(&pool, &job.id, "w", Some(7), "command exited with code 7")
                .await
                .unwrap()
        );

        let job = get(&pool, "goner").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.exit_code, Some(7));
        assert_eq!(job.last_error.as_deref(), Some("command exited with code 7"));
    }
}
