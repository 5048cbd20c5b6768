#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod errors;
mod executor;
mod job_spec;
mod logs;
mod queue;
mod runner;
/// Database row types.
pub mod schema;
mod shutdown;
mod storage;
mod store;
mod util;
mod worker;

/// Error type for queue operations.
pub use self::errors::{QueueError, Result};
/// Ingest-side description of a job to enqueue.
pub use self::job_spec::JobSpec;
/// The queue handle and its on-disk layout.
pub use self::queue::{Queue, QueueConfig};
/// The worker pool supervisor.
pub use self::runner::{RunHandle, Runner};
/// Core row types, re-exported for convenience.
pub use self::schema::{Job, JobState, QueueStatus};
/// Recognized config keys.
pub use self::config::{BACKOFF_BASE, MAX_RETRIES, POLL_INTERVAL, STALE_LOCK_SECONDS};
