//! Process-count control via cgroups v2.

use std::path::Path;

use nestbox_common::error::{NestboxError, Result};

/// Caps the number of tasks in the cgroup via `pids.max`.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn set_pids_max(cgroup_path: &Path, max: u64) -> Result<()> {
    let file = cgroup_path.join("pids.max");
    std::fs::write(&file, max.to_string()).map_err(|e| NestboxError::io(file, e))?;
    tracing::debug!(max, "process limit set");
    Ok(())
}
