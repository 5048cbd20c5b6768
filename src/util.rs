use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;

/// Upper bound on a computed retry delay, in seconds (24 hours).
///
/// `base ^ attempts` overflows quickly for large attempt counts; every
/// delay is clamped here before being added to the clock.
pub(crate) const MAX_BACKOFF_SECONDS: i64 = 86_400;

/// Current UTC time, truncated to whole seconds.
///
/// All persisted timestamps go through this so that stored values
/// compare consistently regardless of sub-second noise.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Generate a worker identity of the form `host-pid-index-random`.
pub(crate) fn worker_id(index: usize) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!(
        "{}-{}-{}-{:08x}",
        hostname(),
        std::process::id(),
        index,
        suffix
    )
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("localhost"))
}

#[cfg(not(unix))]
fn hostname() -> String {
    String::from("localhost")
}

/// Retry delay in seconds for the given (post-increment) attempt count.
pub(crate) fn backoff_delay(base: i64, attempts: i64) -> i64 {
    let base = base.max(1);
    let Ok(exp) = u32::try_from(attempts) else {
        return MAX_BACKOFF_SECONDS;
    };
    base.checked_pow(exp)
        .map_or(MAX_BACKOFF_SECONDS, |d| d.min(MAX_BACKOFF_SECONDS))
}
