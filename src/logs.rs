//! Per-job append-only log files.
//!
//! Each job owns a stable `<id>_out.txt`/`<id>_err.txt` pair so that
//! operators can `tail` a job across attempts. Ids are sanitised before
//! touching the filesystem.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Replace path separators and other unsafe characters so an id can be
/// embedded in a file name.
pub(crate) fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The stable (stdout, stderr) log paths for a job id.
pub(crate) fn log_paths(log_dir: &Path, id: &str) -> (PathBuf, PathBuf) {
    let safe = sanitize_id(id);
    (
        log_dir.join(format!("{safe}_out.txt")),
        log_dir.join(format!("{safe}_err.txt")),
    )
}

/// Open a log file for appending and write the attempt header.
///
/// The returned handle is passed to the child process as raw stdio, so
/// the command's output streams straight to disk.
pub(crate) fn open_attempt(
    path: &Path,
    attempt: i64,
    started_at: DateTime<Utc>,
) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "=== Attempt {attempt} at {started_at} ===")?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_id("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_id("job:1/2"), "job_1_2");
        assert_eq!(sanitize_id("plain-id_0.9"), "plain-id_0.9");
    }

    #[test]
    fn paths_are_stable_per_id() {
        let dir = Path::new("/tmp/logs");
        let (out, err) = log_paths(dir, "backup");
        assert_eq!(out, dir.join("backup_out.txt"));
        assert_eq!(err, dir.join("backup_err.txt"));
        assert_eq!(log_paths(dir, "backup"), log_paths(dir, "backup"));
    }
}
