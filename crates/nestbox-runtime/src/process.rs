//! Process orchestration on the host side of `clone(2)`.
//!
//! [`start`] takes a validated run request to a running, isolated init
//! process: cgroup scope first, then the clone with every namespace at
//! once, then id maps, cgroup membership and networking for the new PID,
//! and finally the handshake that lets the child isolate itself.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::Utc;
use nestbox_common::config::RuntimeConfig;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::{ContainerId, ContainerStatus, ResourceLimits, VolumeSpec};
use nestbox_core::cgroup::CgroupScope;
use nestbox_core::namespace::NamespaceConfig;
use nestbox_core::namespace::user::{IdMap, write_id_maps};
use nestbox_core::sync::{self, ChildMessage, ParentEnd, ParentMessage};
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::container::ContainerRecord;
use crate::init::{self, InitSpec};
use crate::logs;
use crate::network::NetworkManager;
use crate::state::StateStore;

const STACK_SIZE: usize = 1024 * 1024;
const DEV_NULL: &str = "/dev/null";

/// A request to run one command in a new container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Command and arguments; must not be empty.
    pub command: Vec<String>,
    /// CPU and memory limits.
    pub limits: ResourceLimits,
    /// Volumes to bind-mount.
    pub volumes: Vec<VolumeSpec>,
    /// Absolute path of the root filesystem.
    pub rootfs: PathBuf,
    /// Return as soon as the container runs instead of waiting for it.
    pub detached: bool,
}

impl RunRequest {
    /// Rejects requests that would fail before any resource is touched.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] for an empty command, a
    /// missing rootfs, or an invalid volume.
    pub fn validate(&self) -> Result<()> {
        if self.command.first().is_none_or(String::is_empty) {
            return Err(NestboxError::invalid("command cannot be empty"));
        }
        if !self.rootfs.is_dir() {
            return Err(NestboxError::invalid(format!(
                "rootfs not found: {}",
                self.rootfs.display()
            )));
        }
        for volume in &self.volumes {
            volume.validate()?;
        }
        Ok(())
    }
}

/// A container whose init process completed setup.
#[derive(Debug)]
pub struct Launched {
    /// The persisted record as of startup.
    pub record: ContainerRecord,
    /// Host PID of the init process.
    pub pid: Pid,
    pumps: Vec<JoinHandle<()>>,
}

impl Launched {
    /// Waits until the container's output has been fully copied to the log
    /// and terminal. Only foreground runs have output pumps.
    pub fn drain_output(&mut self) {
        for pump in self.pumps.drain(..) {
            if pump.join().is_err() {
                tracing::warn!("output pump panicked");
            }
        }
    }
}

#[cfg(test)]
impl Launched {
    /// Wraps an already running child of this process, without output pumps.
    pub(crate) fn adopt(record: ContainerRecord, pid: Pid) -> Self {
        Self {
            record,
            pid,
            pumps: Vec::new(),
        }
    }
}

/// Where the child's standard streams point after `clone(2)`.
struct ChildStdio {
    stdin: Option<OwnedFd>,
    stdout: OwnedFd,
    stderr: OwnedFd,
}

impl ChildStdio {
    fn as_fds(&self) -> init::StdioFds<'_> {
        init::StdioFds {
            stdin: self.stdin.as_ref().map(AsFd::as_fd),
            stdout: self.stdout.as_fd(),
            stderr: self.stderr.as_fd(),
        }
    }
}

/// Starts a container and returns once its command is running.
///
/// # Errors
///
/// Returns an error if the request is invalid, or a fatal setup step on
/// either side of the clone fails. Everything acquired up to that point is
/// released before returning.
pub fn start(
    config: &RuntimeConfig,
    store: &StateStore,
    network: &NetworkManager,
    request: RunRequest,
) -> Result<Launched> {
    request.validate()?;
    let id = ContainerId::generate();
    tracing::info!(id = %id, command = ?request.command, "starting container");

    let scope = CgroupScope::create(&config.cgroup_root, id.as_str())
        .map_err(|e| NestboxError::setup("cgroup", e))?;
    if let Err(e) = scope.apply_limits(&request.limits, config.pids_max) {
        scope.destroy();
        return Err(NestboxError::setup("cgroup", e));
    }

    let log_file_path = logs::log_path(&config.logs_dir(), id.as_str());
    let (stdio, pumps_src) = match prepare_stdio(&log_file_path, request.detached) {
        Ok(v) => v,
        Err(e) => {
            discard(&scope, &log_file_path);
            return Err(e);
        }
    };

    let namespaces = NamespaceConfig::for_caller();
    let spawned = {
        let spec = InitSpec {
            command: request.command.clone(),
            hostname: config.hostname.clone(),
            volumes: request.volumes.clone(),
            rootfs: request.rootfs.clone(),
            stdio: stdio.as_fds(),
        };
        spawn_init(&spec, namespaces)
    };
    drop(stdio);
    let (mut parent, pid) = match spawned {
        Ok(v) => v,
        Err(e) => {
            discard(&scope, &log_file_path);
            return Err(e);
        }
    };
    tracing::info!(id = %id, pid = pid.as_raw(), "container process cloned");

    let host_pid = pid_u32(pid);
    let early = if namespaces.user {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        write_id_maps(host_pid, IdMap::root_to(uid), IdMap::root_to(gid))
            .map_err(|e| NestboxError::setup("id-map", e))
    } else {
        Ok(())
    };
    let early = early.and_then(|()| {
        scope
            .add_process(host_pid)
            .map_err(|e| NestboxError::setup("cgroup", e))
    });
    if let Err(e) = early {
        abort_child(&mut parent, pid, &e);
        discard(&scope, &log_file_path);
        return Err(e);
    }

    let pumps = pumps_src
        .map(|src| src.spawn(&log_file_path))
        .transpose()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "container output will not be copied to the log");
            None
        })
        .unwrap_or_default();

    let mut record = ContainerRecord {
        id: id.clone(),
        pid: host_pid,
        status: ContainerStatus::Running,
        created_at: Utc::now(),
        command: request.command,
        veth_host_name: None,
        veth_peer_name: None,
        container_ip: None,
        log_file_path,
        detached: request.detached,
        cgroup_path: scope.path().to_path_buf(),
        rootfs_path: request.rootfs,
        limits: request.limits,
        volumes: request.volumes,
        exit_code: None,
    };
    if let Err(e) = store.save(&record) {
        abort_child(&mut parent, pid, &e);
        for pump in pumps {
            let _ = pump.join();
        }
        discard(&scope, &record.log_file_path);
        return Err(e);
    }

    let assignment = match network.attach(store, &id, host_pid) {
        Ok((pair, assignment)) => {
            record.veth_host_name = Some(pair.host);
            record.veth_peer_name = Some(pair.peer);
            record.container_ip = Some(assignment.address);
            let (host, peer, ip) = (
                record.veth_host_name.clone(),
                record.veth_peer_name.clone(),
                record.container_ip,
            );
            if let Err(e) = store.update(&id, |r| {
                r.veth_host_name = host;
                r.veth_peer_name = peer;
                r.container_ip = ip;
                Ok(())
            }) {
                tracing::warn!(id = %id, error = %e, "failed to persist network details");
            }
            Some(assignment)
        }
        Err(e) => {
            tracing::warn!(id = %id, error = %e, "network setup failed, container runs without network");
            None
        }
    };

    if let Err(e) = parent.send(&ParentMessage::Ready { network: assignment }) {
        tracing::debug!(id = %id, error = %e, "child gone before ready");
    }

    let failure = match parent.recv() {
        Ok(Some(ChildMessage::Started)) => None,
        Ok(Some(ChildMessage::SetupFailed { step, message })) => {
            Some(NestboxError::Setup { step, message })
        }
        Ok(None) => Some(NestboxError::setup("init", "container exited during setup")),
        Err(e) => Some(e),
    };
    if let Some(e) = failure {
        tracing::error!(id = %id, error = %e, "container setup failed");
        let code = reap(pid);
        for pump in pumps {
            let _ = pump.join();
        }
        network.release(store, &id, record.veth_host_name.as_deref());
        scope.destroy();
        if let Err(err) = store.update(&id, |r| {
            r.status = ContainerStatus::Exited;
            r.exit_code = code;
            Ok(())
        }) {
            tracing::warn!(id = %id, error = %err, "failed to record setup failure");
        }
        return Err(e);
    }

    tracing::info!(id = %id, pid = host_pid, ip = ?record.container_ip, "container running");
    Ok(Launched { record, pid, pumps })
}

/// Undoes host-side setup for a container that has no record to show for it.
fn discard(scope: &CgroupScope, log_file_path: &Path) {
    scope.destroy();
    if let Err(e) = logs::remove_log(log_file_path) {
        tracing::debug!(path = %log_file_path.display(), error = %e, "log not removed");
    }
}

fn spawn_init(spec: &InitSpec<'_>, namespaces: NamespaceConfig) -> Result<(ParentEnd, Pid)> {
    let (parent, child) = sync::channel()?;
    let mut child = Some(child);
    let mut stack = vec![0u8; STACK_SIZE];

    let callback = Box::new(|| -> isize {
        child
            .take()
            .map_or(1, |channel| isize::try_from(init::run(spec, channel)).unwrap_or(1))
    });
    // SAFETY: no output pumps exist yet, and the only other thread the CLI
    // may run (the interrupt watcher) sits in a blocking read holding no
    // locks, so the child's copy of the address space is consistent. The
    // callback only touches data it was handed and exits the child when it
    // returns.
    let pid = unsafe {
        nix::sched::clone(
            callback,
            &mut stack,
            namespaces.clone_flags(),
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| NestboxError::setup("clone", e))?;

    drop(child);
    Ok((parent, pid))
}

fn abort_child(parent: &mut ParentEnd, pid: Pid, cause: &NestboxError) {
    let _ = parent.send(&ParentMessage::Abort {
        reason: cause.to_string(),
    });
    let _ = kill(pid, Signal::SIGKILL);
    let _ = reap(pid);
}

/// Waits for `pid` and returns its exit code, `128 + signal` if killed.
pub(crate) fn reap(pid: Pid) -> Option<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    return Some(code);
                }
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(_) => return None,
        }
    }
}

/// Exit code for a terminal wait status.
pub(crate) fn exit_code(status: nix::sys::wait::WaitStatus) -> Option<i32> {
    use nix::sys::wait::WaitStatus;
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

fn pid_u32(pid: Pid) -> u32 {
    u32::try_from(pid.as_raw()).unwrap_or_default()
}

/// Read ends of the foreground output pipes.
struct OutputPipes {
    stdout: OwnedFd,
    stderr: OwnedFd,
}

impl OutputPipes {
    fn spawn(self, log_path: &Path) -> Result<Vec<JoinHandle<()>>> {
        let log = logs::open_for_append(log_path)?;
        let log_err = log.try_clone().map_err(|e| NestboxError::io(log_path, e))?;
        Ok(vec![
            pump(File::from(self.stdout), log, std::io::stdout()),
            pump(File::from(self.stderr), log_err, std::io::stderr()),
        ])
    }
}

/// Copies everything from `src` to both the log and the terminal.
fn pump<W: Write + Send + 'static>(mut src: File, mut log: File, mut term: W) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let _ = log.write_all(&buf[..n]);
            let _ = term.write_all(&buf[..n]).and_then(|()| term.flush());
        }
    })
}

fn prepare_stdio(log_path: &Path, detached: bool) -> Result<(ChildStdio, Option<OutputPipes>)> {
    if detached {
        let log = logs::open_for_append(log_path)?;
        let log_err = log.try_clone().map_err(|e| NestboxError::io(log_path, e))?;
        let null = File::open(DEV_NULL).map_err(|e| NestboxError::io(DEV_NULL, e))?;
        let stdio = ChildStdio {
            stdin: Some(null.into()),
            stdout: log.into(),
            stderr: log_err.into(),
        };
        return Ok((stdio, None));
    }

    let (out_r, out_w) = pipe()?;
    let (err_r, err_w) = pipe()?;
    let stdio = ChildStdio {
        stdin: None,
        stdout: out_w,
        stderr: err_w,
    };
    Ok((
        stdio,
        Some(OutputPipes {
            stdout: out_r,
            stderr: err_r,
        }),
    ))
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| NestboxError::setup("stdio", e))
}
