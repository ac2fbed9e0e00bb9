//! System-wide constants and default paths.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Default base directory for Nestbox state, logs, and the IP pool.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/nestbox";

/// Default parent cgroup shared by every container scope.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/nestbox";

/// Subdirectory of the state directory holding one record file per container.
pub const CONTAINERS_DIR: &str = "containers";

/// Subdirectory of the state directory holding one log file per container.
pub const LOGS_DIR: &str = "logs";

/// File name of the persisted IP pool.
pub const IPAM_FILE: &str = "ipam.json";

/// Name of the host-wide bridge interface.
pub const BRIDGE_NAME: &str = "nestbox0";

/// Base address of the subnet reserved for containers.
pub const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);

/// Prefix length of the container subnet.
pub const SUBNET_PREFIX_LEN: u8 = 24;

/// Host octet reserved for the bridge address.
pub const BRIDGE_HOST_OCTET: u8 = 1;

/// First host octet handed out to containers.
pub const FIRST_CONTAINER_OCTET: u8 = 2;

/// Last host octet handed out to containers.
pub const LAST_CONTAINER_OCTET: u8 = 254;

/// Kernel limit on network interface name length (`IFNAMSIZ - 1`).
pub const MAX_IFNAME_LEN: usize = 15;

/// Number of container id characters embedded in veth names.
pub const VETH_ID_CHARS: usize = 8;

/// Hard cap on the number of processes in every container.
pub const DEFAULT_PIDS_MAX: u64 = 20;

/// CPU bandwidth period written to `cpu.max`, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Smallest quota the kernel accepts in `cpu.max`, in microseconds.
pub const CPU_MIN_QUOTA_US: u64 = 1_000;

/// Hostname set inside every container's UTS namespace.
pub const DEFAULT_HOSTNAME: &str = "nestbox";

/// Grace period between SIGTERM and SIGKILL for `stop`.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Grace period between SIGTERM and SIGKILL when a foreground run is interrupted.
pub const INTERRUPT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Interval between liveness checks while waiting for a process to exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `PATH` given to the command inside the container.
pub const CONTAINER_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Number of id characters shown by listings and messages.
pub const SHORT_ID_LEN: usize = 12;
