//! Ingest-side description of a job to enqueue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, Result};

/// Everything a caller provides when enqueueing a job.
///
/// Deserializes from the enqueue payload format; unknown fields are
/// rejected. `max_retries` falls back to the stored config default when
/// omitted, `run_at` to "now".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    /// Unique job id, chosen by the caller.
    pub id: String,
    /// Shell command line to execute.
    pub command: String,
    /// Retry cap for this job; total runs is `max_retries + 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Dispatch priority; lower runs earlier. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    /// Per-attempt wall-clock kill deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    /// Earliest time to run the first attempt (UTC). Defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    /// A spec with only the required fields set.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
            priority: None,
            timeout_seconds: None,
            run_at: None,
        }
    }

    /// Override the retry cap.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the dispatch priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// Schedule the first attempt for a later time.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(QueueError::InvalidArg("job `id` must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::InvalidArg(
                "job `command` must not be empty".into(),
            ));
        }
        if self.timeout_seconds == Some(0) {
            return Err(QueueError::InvalidArg(
                "job `timeout_seconds` must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let payload = r#"{"id": "a", "command": "true", "bogus": 1}"#;
        assert!(serde_json::from_str::<JobSpec>(payload).is_err());
    }

    #[test]
    fn run_at_parses_iso8601() {
        let payload = r#"{"id": "a", "command": "true", "run_at": "2026-01-02T03:04:05Z"}"#;
        let spec: JobSpec = serde_json::from_str(payload).unwrap();
        assert_eq!(
            spec.run_at.unwrap().to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn empty_required_fields_fail_validation() {
        assert!(JobSpec::new("", "true").validate().is_err());
        assert!(JobSpec::new("a", "  ").validate().is_err());
        assert!(JobSpec::new("a", "true").validate().is_ok());
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let spec = JobSpec::new("a", "true").timeout_seconds(0);
        assert!(spec.validate().is_err());
    }
}
