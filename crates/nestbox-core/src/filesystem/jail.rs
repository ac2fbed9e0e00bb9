//! Filesystem jail via `chroot(2)`.

use std::path::Path;

use nestbox_common::error::{NestboxError, Result};

/// Changes the root directory to `rootfs` and the working directory to `/`.
///
/// Irreversible for the calling process.
///
/// # Errors
///
/// Returns [`NestboxError::Setup`] if `chroot(2)` or `chdir(2)` fails.
pub fn enter_jail(rootfs: &Path) -> Result<()> {
    nix::unistd::chroot(rootfs).map_err(|e| NestboxError::setup("chroot", e))?;
    nix::unistd::chdir("/").map_err(|e| NestboxError::setup("chdir", e))?;
    tracing::info!(rootfs = %rootfs.display(), "entered filesystem jail");
    Ok(())
}
