//! Linux namespace management for container isolation.
//!
//! The isolated child is created with a single `clone(2)` carrying every
//! namespace flag at once; this module decides which flags that is and
//! provides the host-side id mapping and in-namespace hostname helpers.

pub mod user;
pub mod uts;

use nix::sched::CloneFlags;

/// Configuration for which namespaces to create.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl NamespaceConfig {
    /// Namespaces for a container started by the current process.
    ///
    /// A user namespace is only requested when the caller is unprivileged;
    /// root already holds the capabilities the child needs.
    #[must_use]
    pub fn for_caller() -> Self {
        Self {
            user: !nix::unistd::geteuid().is_root(),
            ..Self::default()
        }
    }

    /// Flags to pass to `clone(2)`.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags.set(CloneFlags::CLONE_NEWUSER, self.user);
        flags
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: false,
            uts: true,
        }
    }
}
