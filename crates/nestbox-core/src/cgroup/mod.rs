//! Cgroups v2 resource management.
//!
//! Every container gets its own scope directory below a shared parent
//! (by default `/sys/fs/cgroup/nestbox/<container_id>`). The parent has the
//! `cpu`, `memory` and `pids` controllers enabled for its children on a
//! best-effort basis; scopes are independently named, so concurrent
//! containers never write to the same control files.

pub mod cpu;
pub mod memory;
pub mod pids;

use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::limits::{CpuLimit, MemoryLimit};
use nestbox_common::types::ResourceLimits;

const CONTROLLERS: &str = "+cpu +memory +pids";

/// Handle to one container's cgroup scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupScope {
    path: PathBuf,
}

impl CgroupScope {
    /// Creates the scope for `container_id` below `root`.
    ///
    /// The parent directory is created if needed and its subtree controllers
    /// are enabled best-effort; they may already be on, or unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if either directory cannot be created.
    pub fn create(root: &Path, container_id: &str) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| NestboxError::io(root, e))?;
        if let Err(e) = enable_controllers(root) {
            tracing::warn!(root = %root.display(), error = %e, "could not enable cgroup controllers");
        }

        let path = root.join(container_id);
        std::fs::create_dir_all(&path).map_err(|e| NestboxError::io(&path, e))?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Wraps an existing scope path, e.g. one read back from a container record.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to this scope's directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the process cap and any CPU and memory limits.
    ///
    /// Unlimited CPU or memory leaves the kernel default (`max`) untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a control file fails.
    pub fn apply_limits(&self, limits: &ResourceLimits, pids_max: u64) -> Result<()> {
        pids::set_pids_max(&self.path, pids_max)?;
        if let CpuLimit::Quota { .. } = limits.cpu {
            cpu::set_cpu_max(&self.path, &limits.cpu)?;
        }
        if let MemoryLimit::Bytes(bytes) = limits.memory {
            memory::set_memory_max(&self.path, bytes)?;
        }
        Ok(())
    }

    /// Adds a process to this scope by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string()).map_err(|e| NestboxError::io(procs_path, e))?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Removes the scope directory.
    ///
    /// Best-effort: the kernel refuses to remove a scope that still has
    /// member processes (for example zombies), and that refusal is logged
    /// and swallowed rather than retried.
    pub fn destroy(&self) {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "cgroup destroyed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "cgroup not removed");
            }
        }
    }
}

fn enable_controllers(root: &Path) -> Result<()> {
    let file = root.join("cgroup.subtree_control");
    std::fs::write(&file, CONTROLLERS).map_err(|e| NestboxError::io(file, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).expect("read control file")
    }

    #[test]
    fn create_makes_scope_and_enables_controllers() {
        let root = tempfile::tempdir().expect("tempdir");
        let scope = CgroupScope::create(root.path(), "abc").expect("create");
        assert!(scope.path().is_dir());
        assert_eq!(scope.path(), root.path().join("abc"));
        assert_eq!(read(&root.path().join("cgroup.subtree_control")), CONTROLLERS);
    }

    #[test]
    fn limits_are_written_in_kernel_syntax() {
        let root = tempfile::tempdir().expect("tempdir");
        let scope = CgroupScope::create(root.path(), "lim").expect("create");
        let limits = ResourceLimits::parse(Some("0.5"), Some("512M")).expect("parse");
        scope.apply_limits(&limits, 20).expect("apply");

        assert_eq!(read(&scope.path().join("pids.max")), "20");
        assert_eq!(read(&scope.path().join("cpu.max")), "50000 100000");
        assert_eq!(read(&scope.path().join("memory.max")), "536870912");
    }

    #[test]
    fn unlimited_resources_leave_files_untouched() {
        let root = tempfile::tempdir().expect("tempdir");
        let scope = CgroupScope::create(root.path(), "free").expect("create");
        scope
            .apply_limits(&ResourceLimits::default(), 20)
            .expect("apply");
        assert!(!scope.path().join("cpu.max").exists());
        assert!(!scope.path().join("memory.max").exists());
    }

    #[test]
    fn add_process_writes_pid() {
        let root = tempfile::tempdir().expect("tempdir");
        let scope = CgroupScope::create(root.path(), "p").expect("create");
        scope.add_process(4242).expect("add");
        assert_eq!(read(&scope.path().join("cgroup.procs")), "4242");
    }

    #[test]
    fn destroy_removes_empty_scope_and_tolerates_busy_or_missing() {
        let root = tempfile::tempdir().expect("tempdir");
        let empty = CgroupScope::create(root.path(), "empty").expect("create");
        empty.destroy();
        assert!(!empty.path().exists());
        empty.destroy();

        let busy = CgroupScope::create(root.path(), "busy").expect("create");
        busy.add_process(1).expect("add");
        busy.destroy();
        assert!(busy.path().exists());
    }
}
