//! The container's init process.
//!
//! Runs as PID 1 of the new PID namespace, on the clone stack, with a copy
//! of the orchestrator's memory. It waits for the host side to finish,
//! isolates itself through the setup pipeline, then spawns the user command
//! and stays around to forward signals and reap orphans until the command
//! exits. Its return value becomes the container's exit status.

use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};

use nestbox_common::constants::CONTAINER_PATH_ENV;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::VolumeSpec;
use nestbox_core::setup::{SetupPipeline, SetupPlan};
use nestbox_core::sync::{ChildEnd, ChildMessage, ParentMessage};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::process::exit_code;

const FAILURE: i32 = 1;
const EXEC_FAILURE: i32 = 127;

static COMMAND_PID: AtomicI32 = AtomicI32::new(0);

/// Descriptors to install as the child's standard streams.
///
/// Borrowed from the orchestrator, which keeps them open until the clone
/// has happened.
#[derive(Debug, Clone, Copy)]
pub struct StdioFds<'fd> {
    /// Replacement for stdin, if any.
    pub stdin: Option<BorrowedFd<'fd>>,
    /// Replacement for stdout.
    pub stdout: BorrowedFd<'fd>,
    /// Replacement for stderr.
    pub stderr: BorrowedFd<'fd>,
}

/// Everything init needs, handed over by value across `clone(2)`.
#[derive(Debug, Clone)]
pub struct InitSpec<'fd> {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Hostname inside the UTS namespace.
    pub hostname: String,
    /// Volumes to mount before entering the jail.
    pub volumes: Vec<VolumeSpec>,
    /// Root filesystem.
    pub rootfs: PathBuf,
    /// Standard stream redirections.
    pub stdio: StdioFds<'fd>,
}

/// Entry point of the cloned child. Returns the process exit status.
pub fn run(spec: &InitSpec<'_>, mut channel: ChildEnd) -> i32 {
    channel.close_inherited();
    if let Err(e) = install_stdio(spec.stdio) {
        let _ = channel.send(&ChildMessage::SetupFailed {
            step: "stdio".into(),
            message: e.to_string(),
        });
        return FAILURE;
    }

    let network = match channel.recv() {
        Ok(Some(ParentMessage::Ready { network })) => network,
        Ok(Some(ParentMessage::Abort { reason })) => {
            tracing::error!(reason = %reason, "host aborted container setup");
            return FAILURE;
        }
        Ok(None) => {
            tracing::error!("orchestrator exited before setup completed");
            return FAILURE;
        }
        Err(e) => {
            tracing::error!(error = %e, "setup handshake failed");
            return FAILURE;
        }
    };

    let plan = SetupPlan {
        network,
        hostname: spec.hostname.clone(),
        volumes: spec.volumes.clone(),
        rootfs: spec.rootfs.clone(),
    };
    let guard = match SetupPipeline::new(plan).run() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(error = %e, "container setup failed");
            let _ = channel.send(&failure_message(e));
            return FAILURE;
        }
    };

    let argv = command_argv(&spec.command);
    let spawned = match argv.split_first() {
        Some((program, args)) => Command::new(program)
            .args(args)
            .env("PATH", CONTAINER_PATH_ENV)
            .spawn()
            .map_err(|e| format!("{program}: {e}")),
        None => Err("empty command".to_string()),
    };
    let child = match spawned {
        Ok(child) => child,
        Err(message) => {
            let _ = channel.send(&ChildMessage::SetupFailed {
                step: "exec".into(),
                message,
            });
            return EXEC_FAILURE;
        }
    };
    let command_pid = Pid::from_raw(i32::try_from(child.id()).unwrap_or(-1));
    COMMAND_PID.store(command_pid.as_raw(), Ordering::SeqCst);
    install_forwarding();

    let _ = channel.send(&ChildMessage::Started);
    drop(channel);
    tracing::debug!(pid = command_pid.as_raw(), "command started");

    let code = reap_until(command_pid);
    drop(guard);
    code
}

fn failure_message(e: NestboxError) -> ChildMessage {
    match e {
        NestboxError::Setup { step, message } => ChildMessage::SetupFailed { step, message },
        other => ChildMessage::SetupFailed {
            step: "setup".into(),
            message: other.to_string(),
        },
    }
}

/// The command as it is executed; a lone shell is made interactive.
fn command_argv(command: &[String]) -> Vec<String> {
    let mut argv = command.to_vec();
    if matches!(command, [only] if only == "/bin/sh" || only == "sh") {
        argv.push("-i".into());
    }
    argv
}

fn install_stdio(fds: StdioFds<'_>) -> Result<()> {
    let failed = |e: nix::errno::Errno| NestboxError::setup("stdio", e);
    if let Some(stdin) = fds.stdin {
        nix::unistd::dup2_stdin(stdin).map_err(failed)?;
    }
    nix::unistd::dup2_stdout(fds.stdout).map_err(failed)?;
    nix::unistd::dup2_stderr(fds.stderr).map_err(failed)?;
    Ok(())
}

/// Relays `sig` to the running command; kill(2) is async-signal-safe.
extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = COMMAND_PID.load(Ordering::SeqCst);
    if pid <= 0 {
        return;
    }
    if let Ok(signal) = Signal::try_from(sig) {
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

fn install_forwarding() {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only reads an atomic and calls kill(2).
        if let Err(e) = unsafe { sigaction(sig, &action) } {
            tracing::warn!(signal = ?sig, error = %e, "signal forwarding not installed");
        }
    }
}

/// Reaps every child until `command` exits; returns its exit code.
fn reap_until(command: Pid) -> i32 {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) if status.pid() == Some(command) => {
                if let Some(code) = exit_code(status) {
                    return code;
                }
            }
            Ok(status) => tracing::debug!(?status, "reaped orphan"),
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                tracing::warn!(error = %e, "wait failed");
                return FAILURE;
            }
        }
    }
}
