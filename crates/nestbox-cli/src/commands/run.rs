//! `nbx run`: Run a command in a new container.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Args;
use nestbox_common::types::{ResourceLimits, VolumeSpec};
use nestbox_runtime::engine::Engine;
use nestbox_runtime::process::RunRequest;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// CPU limit in cores, e.g. `0.5`, or `unlimited`.
    #[arg(long)]
    pub cpu_limit: Option<String>,

    /// Memory limit, e.g. `512M` or `1G`, or `unlimited`.
    #[arg(long)]
    pub memory_limit: Option<String>,

    /// Bind mount a host path into the container (`HOST:CONTAINER`).
    #[arg(short, long)]
    pub volume: Vec<String>,

    /// Run in the background and print the container id.
    #[arg(short, long)]
    pub detach: bool,

    /// Root filesystem directory. Defaults to `rootfs/` next to the
    /// executable, then `./rootfs`.
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Command and arguments to run inside the container.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command.
///
/// A foreground run returns the container command's exit code; Ctrl+C or
/// SIGTERM stops the container and still cleans up.
///
/// # Errors
///
/// Returns an error if an argument is invalid or the container fails to
/// start.
pub fn execute(engine: &Engine, args: RunArgs) -> anyhow::Result<ExitCode> {
    let limits = ResourceLimits::parse(args.cpu_limit.as_deref(), args.memory_limit.as_deref())?;
    let volumes = args
        .volume
        .iter()
        .map(|v| VolumeSpec::parse(v))
        .collect::<Result<Vec<_>, _>>()?;
    let rootfs = resolve_rootfs(args.rootfs.as_deref(), exe_dir().as_deref(), &cwd()?)?;
    let request = RunRequest {
        command: args.command,
        limits,
        volumes,
        rootfs,
        detached: args.detach,
    };

    if args.detach {
        let running = engine.run(request)?;
        println!("{}", running.id());
        return Ok(ExitCode::SUCCESS);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install interrupt handler")?;

    let running = engine.run(request)?;
    tracing::info!(id = %running.id(), "container started");
    let code = running.wait(&interrupted)?;
    Ok(ExitCode::from(u8::try_from(code & 0xff).unwrap_or(1)))
}

/// Picks the root filesystem: the explicit flag, else `rootfs/` beside the
/// executable, else `rootfs/` in the working directory.
fn resolve_rootfs(flag: Option<&Path>, exe_dir: Option<&Path>, cwd: &Path) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        return std::fs::canonicalize(path)
            .with_context(|| format!("root filesystem not found: {}", path.display()));
    }
    exe_dir
        .map(|dir| dir.join("rootfs"))
        .into_iter()
        .chain(std::iter::once(cwd.join("rootfs")))
        .find(|candidate| candidate.is_dir())
        .ok_or_else(|| anyhow::anyhow!("no root filesystem found; pass --rootfs or create ./rootfs"))
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn cwd() -> anyhow::Result<PathBuf> {
    std::env::current_dir().context("cannot determine working directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_rootfs_is_made_absolute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = dir.path().join("alpine");
        std::fs::create_dir(&rootfs).expect("mkdir");

        let resolved = resolve_rootfs(Some(&rootfs), None, dir.path()).expect("resolve");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("alpine"));
    }

    #[test]
    fn missing_explicit_rootfs_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(resolve_rootfs(Some(&missing), None, dir.path()).is_err());
    }

    #[test]
    fn executable_directory_wins_over_working_directory() {
        let exe = tempfile::tempdir().expect("tempdir");
        let work = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(exe.path().join("rootfs")).expect("mkdir");
        std::fs::create_dir(work.path().join("rootfs")).expect("mkdir");

        let resolved = resolve_rootfs(None, Some(exe.path()), work.path()).expect("resolve");
        assert_eq!(resolved, exe.path().join("rootfs"));
    }

    #[test]
    fn working_directory_is_the_fallback() {
        let exe = tempfile::tempdir().expect("tempdir");
        let work = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(work.path().join("rootfs")).expect("mkdir");

        let resolved = resolve_rootfs(None, Some(exe.path()), work.path()).expect("resolve");
        assert_eq!(resolved, work.path().join("rootfs"));
        assert!(resolve_rootfs(None, Some(exe.path()), exe.path()).is_err());
    }
}
