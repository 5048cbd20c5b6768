//! Durable scalar configuration, stored next to the jobs it governs.
//!
//! Workers re-read these values on every poll, so a `set` takes effect
//! within one poll interval without restarting the pool.

use std::collections::BTreeMap;

use sqlx::SqlitePool;

use crate::errors::{QueueError, Result};
use crate::store;

/// Default retry cap applied when a job spec omits `max_retries`.
pub const MAX_RETRIES: &str = "max_retries";
/// Base `b` of the retry delay formula `b ^ attempts` seconds.
pub const BACKOFF_BASE: &str = "backoff_base";
/// Seconds a worker sleeps between idle polls.
pub const POLL_INTERVAL: &str = "poll_interval";
/// Age in seconds past which a `processing` claim counts as abandoned.
pub const STALE_LOCK_SECONDS: &str = "stale_lock_seconds";

/// Seeded on first use; `set` can overwrite them at runtime.
pub(crate) const DEFAULTS: [(&str, &str); 4] = [
    (MAX_RETRIES, "3"),
    (BACKOFF_BASE, "2"),
    (POLL_INTERVAL, "1"),
    (STALE_LOCK_SECONDS, "300"),
];

/// Fetch a raw config value, or `None` if the key was never set.
pub(crate) async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

/// Fetch every config entry, ordered by key.
pub(crate) async fn all(pool: &SqlitePool) -> Result<BTreeMap<String, String>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM config ORDER BY key")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Validate and persist a config value.
///
/// Only the four recognized keys are accepted, and each value must be
/// an integer within the key's legal range (`backoff_base` in
/// particular must be at least 1; a base of 0 would produce zero-delay
/// tight retry loops).
pub(crate) async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    let parsed: i64 = value
        .trim()
        .parse()
        .map_err(|_| QueueError::InvalidArg(format!("`{key}` must be an integer, got `{value}`")))?;

    let min = match key {
        MAX_RETRIES => 0,
        BACKOFF_BASE | POLL_INTERVAL | STALE_LOCK_SECONDS => 1,
        _ => return Err(QueueError::InvalidArg(format!("unknown config key `{key}`"))),
    };
    if parsed < min {
        return Err(QueueError::InvalidArg(format!(
            "`{key}` must be at least {min}, got {parsed}"
        )));
    }

    store::with_busy_retry(|| {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(parsed.to_string())
        .execute(pool)
    })
    .await?;

    Ok(())
}

async fn get_int(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    Ok(get(pool, key)
        .await?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default))
}

pub(crate) async fn max_retries(pool: &SqlitePool) -> Result<i64> {
    get_int(pool, MAX_RETRIES, 3).await
}

pub(crate) async fn backoff_base(pool: &SqlitePool) -> Result<i64> {
    get_int(pool, BACKOFF_BASE, 2).await
}

pub(crate) async fn poll_interval(pool: &SqlitePool) -> Result<i64> {
    Ok(get_int(pool, POLL_INTERVAL, 1).await?.max(1))
}

pub(crate) async fn stale_lock_seconds(pool: &SqlitePool) -> Result<i64> {
    Ok(get_int(pool, STALE_LOCK_SECONDS, 300).await?.max(1))
}
