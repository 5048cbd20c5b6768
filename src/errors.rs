use thiserror::Error;

/// Errors surfaced by queue operations.
///
/// Execution failures (non-zero exit, timeout, spawn error) are *not*
/// errors at this level; they are recorded on the job row and drive the
/// retry state machine instead.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A job with the same id already exists.
    #[error("job `{0}` already exists")]
    DuplicateId(String),

    /// A required field was missing, empty, or malformed.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The operation referenced a job id that does not exist.
    #[error("job `{0}` not found")]
    NotFound(String),

    /// The job is not in a state that permits the requested transition.
    #[error("job `{id}` is `{actual}`, expected `{expected}`")]
    InvalidState {
        /// Id of the offending job.
        id: String,
        /// State the job is actually in.
        actual: String,
        /// State the operation requires.
        expected: String,
    },

    /// The database stayed busy after bounded internal retries.
    #[error("database busy after {0} attempts")]
    Busy(u32),

    /// A non-transient database failure (corruption, disk full, ...).
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    /// Filesystem failure while preparing job log files.
    #[error("log file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QueueError>;
