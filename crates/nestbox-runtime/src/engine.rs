//! Runtime engine that orchestrates container lifecycle.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nestbox_common::config::RuntimeConfig;
use nestbox_common::constants::POLL_INTERVAL;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::{ContainerId, ContainerStatus};
use nestbox_core::cgroup::CgroupScope;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::container::ContainerRecord;
use crate::logs;
use crate::network::NetworkManager;
use crate::process::{self, Launched, RunRequest};
use crate::state::StateStore;

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The container was running and is now stopped.
    Stopped,
    /// Nothing to do; the container already had this terminal status.
    NotRunning(ContainerStatus),
}

/// The runtime engine that coordinates all container operations.
///
/// Owns the state repository and the host network resources for one
/// runtime configuration.
#[derive(Debug)]
pub struct Engine {
    config: RuntimeConfig,
    store: StateStore,
    network: NetworkManager,
}

impl Engine {
    /// Creates an engine that manages the host network with `ip`/`iptables`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let network = NetworkManager::new(config.network.clone());
        Self::with_network(config, network)
    }

    /// Creates an engine with a custom network manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created.
    pub fn with_network(config: RuntimeConfig, network: NetworkManager) -> Result<Self> {
        let store = StateStore::open(&config)?;
        Ok(Self {
            config,
            store,
            network,
        })
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The underlying state repository.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// Starts a container.
    ///
    /// Returns once the command runs inside the container. Foreground
    /// callers then [`wait`](RunningContainer::wait) on the handle; detached
    /// callers just drop it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or a fatal setup step
    /// fails.
    pub fn run(&self, request: RunRequest) -> Result<RunningContainer<'_>> {
        let launched = process::start(&self.config, &self.store, &self.network, request)?;
        Ok(RunningContainer {
            engine: self,
            launched,
        })
    }

    /// Marks every `Running` record whose process is gone as `Exited`.
    ///
    /// Returns the ids that were corrected.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be listed.
    pub fn reconcile(&self) -> Result<Vec<ContainerId>> {
        let mut corrected = Vec::new();
        for record in self.store.list()? {
            if !record.is_running() || is_alive(record.pid) {
                continue;
            }
            match self.mark(&record.id, ContainerStatus::Exited) {
                Ok(true) => {
                    tracing::info!(id = %record.id, pid = record.pid, "process gone, marked exited");
                    corrected.push(record.id);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(id = %record.id, error = %e, "reconciliation failed"),
            }
        }
        Ok(corrected)
    }

    /// Lists all containers, oldest first.
    ///
    /// This is a committing read: it runs [`reconcile`](Self::reconcile)
    /// first, so a listing never reports a dead process as running.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let _ = self.reconcile()?;
        self.store.list()
    }

    /// Loads a container record by id or unambiguous prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not resolve.
    pub fn inspect(&self, id: &str) -> Result<ContainerRecord> {
        self.store.load(id)
    }

    /// Stops a container: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Network and cgroup resources are released and the record is marked
    /// `Stopped`. A container that is not running is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not resolve or the record cannot be
    /// updated.
    pub fn stop(&self, id: &str) -> Result<StopOutcome> {
        let record = self.store.load(id)?;
        if !record.is_running() {
            return Ok(StopOutcome::NotRunning(record.status));
        }

        let pid = to_pid(record.pid);
        if is_alive(record.pid)
            && !terminate(pid, self.config.stop_grace_period, || !is_alive(record.pid))
        {
            tracing::warn!(id = %record.id, pid = record.pid, "process still present after SIGKILL");
        }
        self.release_resources(&record);
        let _ = self.mark(&record.id, ContainerStatus::Stopped)?;
        tracing::info!(id = %record.id, "container stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Deletes a container record and its log.
    ///
    /// Leftover network and cgroup resources are released first, in case a
    /// stop was skipped or interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::StillRunning`] if the process is alive, or an
    /// error if the id does not resolve or files cannot be deleted.
    pub fn remove(&self, id: &str) -> Result<ContainerId> {
        let record = self.store.load(id)?;
        if record.is_running() && is_alive(record.pid) {
            return Err(NestboxError::StillRunning {
                id: record.id.short().to_string(),
            });
        }
        self.release_resources(&record);
        self.store.delete(&record.id)?;
        if let Err(e) = logs::remove_log(&record.log_file_path) {
            tracing::warn!(id = %record.id, error = %e, "log file not removed");
        }
        tracing::info!(id = %record.id, "container removed");
        Ok(record.id)
    }

    /// Writes the container's log to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not resolve or the log is unreadable.
    pub fn logs(&self, id: &str, out: &mut impl Write) -> Result<u64> {
        let record = self.store.load(id)?;
        logs::copy_logs(&record.log_file_path, out)
    }

    /// Moves a record to a terminal `status`.
    ///
    /// Returns `false` without writing if the record already left
    /// `Running`; the first terminal status wins.
    fn mark(&self, id: &ContainerId, status: ContainerStatus) -> Result<bool> {
        match self.store.update_status(id, status) {
            Ok(_) => Ok(true),
            Err(NestboxError::InvalidInput { message }) => {
                tracing::debug!(id = %id, reason = %message, "status left unchanged");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn release_resources(&self, record: &ContainerRecord) {
        self.network
            .release(&self.store, &record.id, record.veth_host_name.as_deref());
        CgroupScope::open(&record.cgroup_path).destroy();
    }
}

/// A started container owned by this process.
#[derive(Debug)]
pub struct RunningContainer<'a> {
    engine: &'a Engine,
    launched: Launched,
}

impl RunningContainer<'_> {
    /// The container's id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.launched.record.id
    }

    /// The record as persisted at startup.
    #[must_use]
    pub const fn record(&self) -> &ContainerRecord {
        &self.launched.record
    }

    /// Waits for the container to exit and cleans up after it.
    ///
    /// When `interrupted` becomes true the container is terminated with the
    /// interrupt grace period and marked `Stopped`; otherwise it ends up
    /// `Exited`. Cleanup runs on both paths. Returns the command's exit code,
    /// `128 + signal` if it was killed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the final status cannot be persisted.
    pub fn wait(mut self, interrupted: &AtomicBool) -> Result<i32> {
        let pid = self.launched.pid;
        let id = self.launched.record.id.clone();
        let mut stopped = false;

        let code = loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if interrupted.load(Ordering::SeqCst) {
                        tracing::info!(id = %id, "interrupted, stopping container");
                        stopped = true;
                        break self.terminate_own(pid);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Ok(status) => {
                    if let Some(code) = process::exit_code(status) {
                        break Some(code);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "lost track of container process");
                    break None;
                }
            }
        };

        self.launched.drain_output();
        self.engine.release_resources(&self.launched.record);
        let final_status = if stopped {
            ContainerStatus::Stopped
        } else {
            ContainerStatus::Exited
        };
        let _ = self.engine.store.update(&id, |r| {
            r.exit_code = code;
            Ok(())
        })?;
        let _ = self.engine.mark(&id, final_status)?;
        tracing::info!(id = %id, code = ?code, status = %final_status, "container finished");
        Ok(code.unwrap_or(1))
    }

    fn terminate_own(&self, pid: Pid) -> Option<i32> {
        let grace = self.engine.config.interrupt_grace_period;
        let mut code = None;
        let gone = terminate(pid, grace, || match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => {
                code = process::exit_code(status);
                code.is_some()
            }
            Err(_) => true,
        });
        if !gone {
            tracing::warn!(pid = pid.as_raw(), "container init still present after SIGKILL");
        }
        code.or_else(|| process::reap(pid))
    }
}

/// How long to wait for a killed process to disappear before cleanup.
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Sends SIGTERM, waits up to `grace` for `gone` to report true, then
/// sends SIGKILL and waits up to [`KILL_SETTLE`] more.
///
/// Returns whether the process is gone, so callers do not tear down a
/// cgroup that still holds a dying task.
fn terminate(pid: Pid, grace: Duration, mut gone: impl FnMut() -> bool) -> bool {
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        tracing::debug!(pid = pid.as_raw(), error = %e, "SIGTERM not delivered");
        return true;
    }
    tracing::debug!(pid = pid.as_raw(), "sent SIGTERM");
    if poll_until(grace, &mut gone) {
        return true;
    }
    match kill(pid, Signal::SIGKILL) {
        Ok(()) => tracing::info!(pid = pid.as_raw(), "grace period expired, sent SIGKILL"),
        Err(e) => {
            tracing::debug!(pid = pid.as_raw(), error = %e, "SIGKILL not delivered");
            return true;
        }
    }
    poll_until(KILL_SETTLE, &mut gone)
}

/// Polls `gone` until it reports true or `limit` elapses, checking once
/// more at the deadline.
fn poll_until(limit: Duration, gone: &mut impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if gone() {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL.min(limit));
    }
    gone()
}

/// Whether a process with this PID exists and is not a zombie.
///
/// A permission error still proves existence.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match kill(to_pid(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, after_comm) = stat.rsplit_once(')')?;
            after_comm.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX))
}
