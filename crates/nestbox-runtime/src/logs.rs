//! Container log files.
//!
//! Each container has one append-only file holding the interleaved stdout
//! and stderr bytes of its command.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(logs_dir: &Path, container_id: &str) -> PathBuf {
    logs_dir.join(format!("{container_id}.log"))
}

/// Opens a container's log for appending, creating it and its directory.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn open_for_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| NestboxError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| NestboxError::io(path, e))
}

/// Copies the whole log file into `out`.
///
/// A log that does not exist yet reads as empty.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, or `out`
/// rejects the bytes.
pub fn copy_logs(path: &Path, out: &mut impl Write) -> Result<u64> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(NestboxError::io(path, e)),
    };
    std::io::copy(&mut file, out).map_err(|e| NestboxError::io(path, e))
}

/// Deletes a log file; a missing file is not an error.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub fn remove_log(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NestboxError::io(path, e)),
    }
}
