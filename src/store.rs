//! SQLite store: connection pool, schema, and transient-conflict retry.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, warn};

use crate::config;
use crate::errors::{QueueError, Result};

/// How many times a busy statement is retried before surfacing.
const BUSY_RETRIES: u32 = 5;
/// Initial pause before the first busy retry; doubles each round.
const BUSY_BACKOFF: Duration = Duration::from_millis(10);

const JOBS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
  id              TEXT PRIMARY KEY,
  command         TEXT NOT NULL,
  state           TEXT NOT NULL,
  priority        INTEGER NOT NULL DEFAULT 0,
  attempts        INTEGER NOT NULL DEFAULT 0,
  max_retries     INTEGER NOT NULL DEFAULT 3,
  timeout_seconds INTEGER,
  next_run_at     TEXT NOT NULL,
  locked_by       TEXT,
  locked_at       TEXT,
  exit_code       INTEGER,
  last_error      TEXT,
  stdout_path     TEXT NOT NULL,
  stderr_path     TEXT NOT NULL,
  created_at      TEXT NOT NULL,
  updated_at      TEXT NOT NULL
)
";

const CONFIG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS config (
  key   TEXT PRIMARY KEY,
  value TEXT NOT NULL
)
";

/// Covers the dispatch query: eligible rows by state and readiness,
/// ordered by priority.
const DISPATCH_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs (state, next_run_at, priority)";

/// Open (or create) the database file and prepare it for concurrent use.
///
/// WAL journaling lets status queries proceed while a worker commits a
/// claim; the busy timeout absorbs short write conflicts at the
/// connection level before [`with_busy_retry`] gets involved.
pub(crate) async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;

    Ok(pool)
}

/// Create tables and indexes if missing and seed default config values.
/// Safe to call any number of times.
pub(crate) async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(JOBS_TABLE).execute(pool).await?;
    sqlx::query(CONFIG_TABLE).execute(pool).await?;
    sqlx::query(DISPATCH_INDEX).execute(pool).await?;

    for (key, value) in config::DEFAULTS {
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }

    debug!("database schema ready");
    Ok(())
}

/// Run a statement, retrying transient `SQLITE_BUSY`/`SQLITE_LOCKED`
/// conflicts with bounded exponential backoff.
///
/// Anything other than a busy error is surfaced immediately.
pub(crate) async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut delay = BUSY_BACKOFF;
    for attempt in 1..=BUSY_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if is_busy(&error) && attempt < BUSY_RETRIES => {
                warn!(%error, attempt, "database busy, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(error) if is_busy(&error) => return Err(QueueError::Busy(BUSY_RETRIES)),
            Err(error) => return Err(error.into()),
        }
    }
    Err(QueueError::Busy(BUSY_RETRIES))
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), including their extended
/// variants (e.g. SQLITE_BUSY_SNAPSHOT, which a claim race produces
/// under WAL).
pub(crate) fn is_busy(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i64>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}
