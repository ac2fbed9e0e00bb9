//! Runtime configuration model.
//!
//! A [`RuntimeConfig`] is built once per invocation and handed to the
//! engine explicitly; nothing below the CLI reads environment variables.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the Nestbox runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base directory for container records, logs, and the IP pool.
    pub state_dir: PathBuf,
    /// Parent cgroup under which each container gets its own scope.
    pub cgroup_root: PathBuf,
    /// Host-wide bridge and subnet parameters.
    pub network: NetworkConfig,
    /// Hostname set inside each container.
    pub hostname: String,
    /// Maximum number of processes per container.
    pub pids_max: u64,
    /// Wait between SIGTERM and SIGKILL for `stop`.
    pub stop_grace_period: Duration,
    /// Wait between SIGTERM and SIGKILL when a foreground run is interrupted.
    pub interrupt_grace_period: Duration,
}

impl RuntimeConfig {
    /// Returns a default configuration rooted at `state_dir`.
    #[must_use]
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Directory holding one record file per container.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.state_dir.join(constants::CONTAINERS_DIR)
    }

    /// Directory holding one log file per container.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join(constants::LOGS_DIR)
    }

    /// Path of the persisted IP pool.
    #[must_use]
    pub fn ipam_file(&self) -> PathBuf {
        self.state_dir.join(constants::IPAM_FILE)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(constants::DEFAULT_STATE_DIR),
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
            network: NetworkConfig::default(),
            hostname: constants::DEFAULT_HOSTNAME.to_string(),
            pids_max: constants::DEFAULT_PIDS_MAX,
            stop_grace_period: constants::STOP_GRACE_PERIOD,
            interrupt_grace_period: constants::INTERRUPT_GRACE_PERIOD,
        }
    }
}

/// Parameters of the single container subnet and its bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Name of the bridge interface.
    pub bridge_name: String,
    /// Base address of the /24 reserved for containers.
    pub subnet: Ipv4Addr,
    /// Prefix length of the subnet.
    pub prefix_len: u8,
}

impl NetworkConfig {
    /// Address of the host side of the bridge, also the containers' gateway.
    #[must_use]
    pub fn bridge_address(&self) -> Ipv4Addr {
        self.host(constants::BRIDGE_HOST_OCTET)
    }

    /// Address with the given host octet inside the subnet.
    #[must_use]
    pub fn host(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, octet)
    }

    /// Subnet in CIDR notation, e.g. `10.0.0.0/24`.
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.subnet, self.prefix_len)
    }

    /// Bridge address in CIDR notation, e.g. `10.0.0.1/24`.
    #[must_use]
    pub fn bridge_cidr(&self) -> String {
        format!("{}/{}", self.bridge_address(), self.prefix_len)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: constants::BRIDGE_NAME.to_string(),
            subnet: constants::SUBNET_BASE,
            prefix_len: constants::SUBNET_PREFIX_LEN,
        }
    }
}
