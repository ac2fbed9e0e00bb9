//! User namespace id mapping.
//!
//! Maps container UID/GID 0 onto the unprivileged caller's host ids,
//! enabling rootless containers. The kernel accepts exactly one write to
//! each map file per namespace, so a short or failed write is fatal and
//! never retried.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use nestbox_common::error::{NestboxError, Result};

/// One `inside outside count` line of a `uid_map`/`gid_map` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// First id inside the namespace.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of consecutive ids mapped.
    pub size: u32,
}

impl IdMap {
    /// Maps container root onto a single host id.
    #[must_use]
    pub const fn root_to(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }

    fn line(&self) -> String {
        format!("{} {} {}\n", self.container_id, self.host_id, self.size)
    }
}

/// Writes the UID and GID maps of the user namespace owned by `pid`.
///
/// `setgroups` is denied first, which unprivileged callers must do before
/// they are allowed to write a GID map.
///
/// # Errors
///
/// Returns [`NestboxError::Setup`] if any of the three files cannot be
/// written in a single, complete write.
pub fn write_id_maps(pid: u32, uid: IdMap, gid: IdMap) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));

    let setgroups = proc_dir.join("setgroups");
    if setgroups.exists() {
        write_once(&setgroups, "deny")?;
    }
    write_once(&proc_dir.join("uid_map"), &uid.line())?;
    write_once(&proc_dir.join("gid_map"), &gid.line())?;

    tracing::debug!(pid, host_uid = uid.host_id, host_gid = gid.host_id, "wrote UID/GID map");
    Ok(())
}

fn write_once(path: &std::path::Path, content: &str) -> Result<()> {
    let step = path
        .file_name()
        .map_or_else(|| "id map".to_string(), |n| n.to_string_lossy().into_owned());
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| NestboxError::setup(&step, e))?;
    let written = file
        .write(content.as_bytes())
        .map_err(|e| NestboxError::setup(&step, e))?;
    if written != content.len() {
        return Err(NestboxError::setup(
            step,
            format!("short write ({written} of {} bytes)", content.len()),
        ));
    }
    Ok(())
}
