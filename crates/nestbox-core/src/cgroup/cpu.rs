//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.max`.

use std::path::Path;

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::limits::CpuLimit;

/// Sets the CPU bandwidth limit.
///
/// Writes `quota_us period_us` to `cpu.max`, where `quota_us` is the
/// maximum CPU time allowed per `period_us` window (`max` when unlimited).
///
/// # Errors
///
/// Returns an error if writing to `cpu.max` fails.
pub fn set_cpu_max(cgroup_path: &Path, limit: &CpuLimit) -> Result<()> {
    let file = cgroup_path.join("cpu.max");
    let value = limit.to_cgroup();
    std::fs::write(&file, &value).map_err(|e| NestboxError::io(file, e))?;
    tracing::debug!(cpu_max = %value, "CPU max quota set");
    Ok(())
}
