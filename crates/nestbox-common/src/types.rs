//! Domain primitive types used across the Nestbox workspace.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{SHORT_ID_LEN, VETH_ID_CHARS};
use crate::error::{NestboxError, Result};
use crate::limits::{CpuLimit, MemoryLimit};

/// Unique identifier for a container instance.
///
/// Generated ids are 32 lowercase hex characters, so any prefix of them is
/// usable both for lookups and for deriving interface names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in listings and messages.
    #[must_use]
    pub fn short(&self) -> &str {
        prefix(&self.0, SHORT_ID_LEN)
    }

    /// Prefix embedded in interface names.
    ///
    /// Two ids sharing this prefix produce colliding veth names; with random
    /// hex ids this is accepted rather than prevented.
    #[must_use]
    pub fn iface_fragment(&self) -> &str {
        prefix(&self.0, VETH_ID_CHARS)
    }
}

fn prefix(s: &str, n: usize) -> &str {
    s.char_indices().nth(n).map_or(s, |(i, _)| &s[..i])
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a container.
///
/// `Running` is the only non-terminal status; a record never moves back to
/// it once it has become `Stopped` or `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The isolated process is believed to be alive.
    Running,
    /// The container was stopped on request.
    Stopped,
    /// The isolated process ended on its own.
    Exited,
}

impl ContainerStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Stopped | Self::Exited | Self::Running)
                | (Self::Stopped, Self::Stopped)
                | (Self::Exited, Self::Exited)
        )
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Resource limits for a container.
///
/// The process-count cap is not part of this type: every container gets
/// the runtime's fixed `pids.max`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU bandwidth limit.
    pub cpu: CpuLimit,
    /// Memory ceiling.
    pub memory: MemoryLimit,
}

impl ResourceLimits {
    /// Parses optional CPU and memory limit strings; absent means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] if either string is malformed.
    pub fn parse(cpu: Option<&str>, memory: Option<&str>) -> Result<Self> {
        Ok(Self {
            cpu: cpu.map(CpuLimit::parse).transpose()?.unwrap_or_default(),
            memory: memory
                .map(MemoryLimit::parse)
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// A host path bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Existing file or directory on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container's root filesystem.
    pub container_path: PathBuf,
}

impl VolumeSpec {
    /// Parses a `host:container` mapping.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] if the spec does not have
    /// exactly two non-empty parts, or the container path is relative or
    /// leaves the root filesystem.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
        let [host, container] = parts.as_slice() else {
            return Err(NestboxError::invalid(format!(
                "invalid volume format: {spec} (expected host:container)"
            )));
        };
        if host.is_empty() || container.is_empty() {
            return Err(NestboxError::invalid(format!(
                "invalid volume format: {spec} (host and container paths cannot be empty)"
            )));
        }
        let vol = Self {
            host_path: PathBuf::from(host),
            container_path: PathBuf::from(container),
        };
        vol.check_container_path()?;
        Ok(vol)
    }

    /// Checks everything that can be checked without touching the
    /// container: the container path is absolute and the host path exists.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        self.check_container_path()?;
        if !self.host_path.exists() {
            return Err(NestboxError::invalid(format!(
                "host path does not exist: {}",
                self.host_path.display()
            )));
        }
        Ok(())
    }

    fn check_container_path(&self) -> Result<()> {
        let path = &self.container_path;
        if !path.is_absolute() {
            return Err(NestboxError::invalid(format!(
                "container path must be absolute: {}",
                path.display()
            )));
        }
        let escapes = path.components().any(|c| c == Component::ParentDir);
        if escapes || path.parent().is_none() {
            return Err(NestboxError::invalid(format!(
                "container path must name a location below /: {}",
                path.display()
            )));
        }
        Ok(())
    }

    /// Mount point of this volume below `rootfs`.
    #[must_use]
    pub fn mount_point(&self, rootfs: &Path) -> PathBuf {
        let relative = self
            .container_path
            .strip_prefix("/")
            .unwrap_or(&self.container_path);
        rootfs.join(relative)
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.host_path.display(),
            self.container_path.display()
        )
    }
}
