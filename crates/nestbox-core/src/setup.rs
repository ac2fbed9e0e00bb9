//! Ordered isolation setup performed by the container's init process.
//!
//! After the host side reports that id maps, cgroup membership and the veth
//! are in place, the child configures itself in a fixed order:
//!
//! 1. network (in-namespace interface configuration, never fatal)
//! 2. hostname
//! 3. volumes (bind mounts below the rootfs, before the jail hides it)
//! 4. jail (`chroot`, irreversible)
//! 5. procfs (held for the lifetime of the container)
//!
//! A failing step rolls back every step before it in reverse order. Steps
//! that must outlive setup are released by the returned [`IsolationGuard`].

use std::fmt;
use std::path::PathBuf;

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::VolumeSpec;

use crate::filesystem::{jail, mount};
use crate::namespace::uts;
use crate::network::NetworkAssignment;
use crate::network::child::configure_self;

/// Everything the child needs to isolate itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPlan {
    /// Interface assignment from the host, `None` when networking degraded.
    pub network: Option<NetworkAssignment>,
    /// Hostname inside the UTS namespace.
    pub hostname: String,
    /// Host paths to bind-mount into the rootfs.
    pub volumes: Vec<VolumeSpec>,
    /// Root filesystem to jail into.
    pub rootfs: PathBuf,
}

/// One stage of container setup.
pub trait SetupStep {
    /// Short name used in error reports.
    fn name(&self) -> &'static str;

    /// Performs the step.
    ///
    /// # Errors
    ///
    /// Returns an error if the step failed and setup must abort.
    fn apply(&mut self) -> Result<()>;

    /// Undoes a successful [`apply`](Self::apply) when a later step fails.
    fn rollback(&mut self) {}

    /// Releases what the step holds once the container exits.
    fn release(&mut self) {}
}

/// The fixed sequence of setup steps.
pub struct SetupPipeline {
    steps: Vec<Box<dyn SetupStep>>,
}

impl SetupPipeline {
    /// Builds the pipeline for a plan, in the only supported order.
    #[must_use]
    pub fn new(plan: SetupPlan) -> Self {
        Self::from_steps(vec![
            Box::new(NetworkStep {
                assignment: plan.network,
            }),
            Box::new(HostnameStep {
                hostname: plan.hostname,
            }),
            Box::new(VolumeStep {
                volumes: plan.volumes,
                rootfs: plan.rootfs.clone(),
                mounted: Vec::new(),
            }),
            Box::new(JailStep { rootfs: plan.rootfs }),
            Box::new(ProcStep { mount: None }),
        ])
    }

    fn from_steps(steps: Vec<Box<dyn SetupStep>>) -> Self {
        Self { steps }
    }

    /// Names of the steps in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every step in order.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::Setup`] naming the failed step, after the
    /// steps that had already succeeded were rolled back.
    pub fn run(mut self) -> Result<IsolationGuard> {
        for index in 0..self.steps.len() {
            let step = &mut self.steps[index];
            let name = step.name();
            tracing::debug!(step = name, "setup step");
            if let Err(e) = step.apply() {
                for done in self.steps[..index].iter_mut().rev() {
                    tracing::debug!(step = done.name(), "rolling back");
                    done.rollback();
                }
                return Err(match e {
                    NestboxError::Setup { .. } => e,
                    other => NestboxError::setup(name, other),
                });
            }
        }
        Ok(IsolationGuard { steps: self.steps })
    }
}

impl fmt::Debug for SetupPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Holds completed setup; releases it in reverse order on drop.
pub struct IsolationGuard {
    steps: Vec<Box<dyn SetupStep>>,
}

impl fmt::Debug for IsolationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationGuard")
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl Drop for IsolationGuard {
    fn drop(&mut self) {
        for step in self.steps.iter_mut().rev() {
            step.release();
        }
    }
}

struct NetworkStep {
    assignment: Option<NetworkAssignment>,
}

impl SetupStep for NetworkStep {
    fn name(&self) -> &'static str {
        "network"
    }

    fn apply(&mut self) -> Result<()> {
        match &self.assignment {
            Some(assignment) => {
                if let Err(e) = configure_self(assignment) {
                    tracing::warn!(error = %e, "container network unavailable");
                }
            }
            None => tracing::warn!("no network assignment, running without connectivity"),
        }
        Ok(())
    }
}

struct HostnameStep {
    hostname: String,
}

impl SetupStep for HostnameStep {
    fn name(&self) -> &'static str {
        "hostname"
    }

    fn apply(&mut self) -> Result<()> {
        uts::set_hostname(&self.hostname)
    }
}

struct VolumeStep {
    volumes: Vec<VolumeSpec>,
    rootfs: PathBuf,
    mounted: Vec<PathBuf>,
}

impl SetupStep for VolumeStep {
    fn name(&self) -> &'static str {
        "volumes"
    }

    fn apply(&mut self) -> Result<()> {
        mount::make_root_private();
        self.mounted = mount::mount_volumes(&self.volumes, &self.rootfs)?;
        Ok(())
    }

    fn rollback(&mut self) {
        for point in self.mounted.drain(..).rev() {
            mount::detach(&point);
        }
    }
}

struct JailStep {
    rootfs: PathBuf,
}

impl SetupStep for JailStep {
    fn name(&self) -> &'static str {
        "jail"
    }

    fn apply(&mut self) -> Result<()> {
        jail::enter_jail(&self.rootfs)
    }
}

struct ProcStep {
    mount: Option<mount::ProcMount>,
}

impl SetupStep for ProcStep {
    fn name(&self) -> &'static str {
        "proc"
    }

    fn apply(&mut self) -> Result<()> {
        self.mount = Some(mount::mount_proc()?);
        Ok(())
    }

    fn rollback(&mut self) {
        self.mount = None;
    }

    fn release(&mut self) {
        self.mount = None;
    }
}
