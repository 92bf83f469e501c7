//! Log directory rotation, run before each new log file is opened.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::{LOG_FILE_EXTENSION, LOG_FILE_PREFIX, MAX_LOG_FILES, MAX_LOG_TOTAL_BYTES};

/// Retention limits for the log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_files: usize,
    pub max_total_bytes: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_files: MAX_LOG_FILES,
            max_total_bytes: MAX_LOG_TOTAL_BYTES,
        }
    }
}

struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
}

/// Whether `name` looks like a session log (`netlog_*.csv`).
pub fn is_log_file_name(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX)
        && Path::new(name).extension().and_then(|e| e.to_str()) == Some(LOG_FILE_EXTENSION)
}

/// Enforce `policy` on `dir`, newest files first.
///
/// Keeps the `max_files` most recently modified logs, then deletes the oldest
/// of those while their total size exceeds `max_total_bytes`. Returns the
/// number of files deleted. Files that fail to delete are logged and skipped.
pub fn rotate_logs(dir: &Path, policy: &RotationPolicy) -> io::Result<usize> {
    let mut files: Vec<LogFile> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_str().is_some_and(is_log_file_name))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some(LogFile {
                path: entry.path(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                len: meta.len(),
            })
        })
        .collect();

    let total: u64 = files.iter().map(|f| f.len).sum();
    if files.len() <= policy.max_files && total <= policy.max_total_bytes {
        return Ok(0);
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    let mut deleted = 0;

    let retained = files.len().min(policy.max_files);
    for file in files.drain(retained..) {
        if remove(&file) {
            deleted += 1;
        }
    }

    let mut size: u64 = files.iter().map(|f| f.len).sum();
    while size > policy.max_total_bytes {
        let Some(oldest) = files.pop() else { break };
        if remove(&oldest) {
            deleted += 1;
            size -= oldest.len;
        }
    }

    if deleted > 0 {
        tracing::info!("Rotated {deleted} old log files in {}", dir.display());
    }
    Ok(deleted)
}

fn remove(file: &LogFile) -> bool {
    match fs::remove_file(&file.path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to delete old log {}: {e}", file.path.display());
            false
        }
    }
}
