//! Mount utilities for container filesystem setup.
//!
//! Handles volume bind mounts below the rootfs and the `/proc` mount
//! inside the container's namespace.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::VolumeSpec;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

const PROC_TARGET: &str = "/proc";

/// Bind-mounts every volume below `rootfs`, in order.
///
/// If a volume fails, the ones already mounted are detached again before
/// the error is returned. Must run before the jail is entered.
///
/// # Errors
///
/// Returns an error if a spec is invalid, a mount point cannot be created,
/// or the bind mount itself fails.
pub fn mount_volumes(specs: &[VolumeSpec], rootfs: &Path) -> Result<Vec<PathBuf>> {
    let mut mounted = Vec::with_capacity(specs.len());
    for spec in specs {
        match bind_volume(spec, rootfs) {
            Ok(point) => mounted.push(point),
            Err(e) => {
                for point in mounted.iter().rev() {
                    detach(point);
                }
                return Err(e);
            }
        }
    }
    Ok(mounted)
}

/// Bind-mounts a single volume and makes it private.
///
/// The mount point is a directory when the host source is a directory and
/// an empty file otherwise. Propagation is set to private-recursive so that
/// mounts made inside the container never reach the host; failing to do so
/// is logged and the volume is kept.
///
/// # Errors
///
/// Returns an error if the spec is invalid, the mount point cannot be
/// created, or `mount(2)` fails.
pub fn bind_volume(spec: &VolumeSpec, rootfs: &Path) -> Result<PathBuf> {
    spec.validate()?;
    let point = spec.mount_point(rootfs);
    create_mount_point(&spec.host_path, &point)?;

    mount(
        Some(spec.host_path.as_path()),
        point.as_path(),
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| NestboxError::PermissionDenied {
        message: format!(
            "bind mount {} -> {} failed: {e}",
            spec.host_path.display(),
            point.display()
        ),
    })?;

    if let Err(e) = mount(
        None::<&str>,
        point.as_path(),
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    ) {
        tracing::warn!(point = %point.display(), error = %e, "failed to set mount propagation");
    }

    tracing::info!(
        host = %spec.host_path.display(),
        container = %spec.container_path.display(),
        "volume mounted"
    );
    Ok(point)
}

fn create_mount_point(source: &Path, point: &Path) -> Result<()> {
    if let Some(parent) = point.parent() {
        std::fs::create_dir_all(parent).map_err(|e| NestboxError::io(parent, e))?;
    }
    if source.is_dir() {
        std::fs::create_dir_all(point).map_err(|e| NestboxError::io(point, e))?;
    } else if !point.exists() {
        let _ = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(point)
            .map_err(|e| NestboxError::io(point, e))?;
    }
    Ok(())
}

/// Marks every mount in the current namespace private, recursively.
///
/// A fresh mount namespace inherits shared propagation from the host, so
/// without this the container's volume and `/proc` mounts would show up
/// outside it. Failure is logged and tolerated.
pub fn make_root_private() {
    if let Err(e) = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    ) {
        tracing::warn!(error = %e, "failed to make mount tree private");
    }
}

/// Lazily detaches a mount, logging rather than failing.
pub fn detach(point: &Path) {
    if let Err(e) = umount2(point, MntFlags::MNT_DETACH) {
        tracing::debug!(point = %point.display(), error = %e, "unmount failed");
    }
}

/// Mounts a fresh procfs at `/proc` of the current root.
///
/// The returned guard unmounts it when dropped, so every exit path of the
/// container init releases it.
///
/// # Errors
///
/// Returns [`NestboxError::Setup`] if the mount point cannot be created or
/// `mount(2)` fails.
pub fn mount_proc() -> Result<ProcMount> {
    let target = Path::new(PROC_TARGET);
    std::fs::create_dir_all(target).map_err(|e| NestboxError::setup("proc", e))?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| NestboxError::setup("proc", e))?;
    tracing::debug!("procfs mounted");
    Ok(ProcMount { _private: () })
}

/// Scope guard for the container's `/proc` mount.
#[derive(Debug)]
pub struct ProcMount {
    _private: (),
}

impl Drop for ProcMount {
    fn drop(&mut self) {
        detach(Path::new(PROC_TARGET));
        tracing::debug!("procfs unmounted");
    }
}
