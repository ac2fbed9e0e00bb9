//! Persisted container record.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use nestbox_common::types::{ContainerId, ContainerStatus, ResourceLimits, VolumeSpec};
use serde::{Deserialize, Serialize};

/// Identity and observable state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Unique identifier.
    pub id: ContainerId,
    /// Host-visible PID of the container's init process.
    pub pid: u32,
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// When the run request was accepted.
    pub created_at: DateTime<Utc>,
    /// Command and arguments run inside the container.
    pub command: Vec<String>,
    /// Host end of the veth pair, once created.
    #[serde(default)]
    pub veth_host_name: Option<String>,
    /// Container end of the veth pair, once created.
    #[serde(default)]
    pub veth_peer_name: Option<String>,
    /// Address inside the container subnet, once allocated.
    #[serde(default)]
    pub container_ip: Option<Ipv4Addr>,
    /// File receiving the command's stdout and stderr.
    pub log_file_path: PathBuf,
    /// Whether the run returned immediately.
    pub detached: bool,
    /// The container's cgroup scope.
    pub cgroup_path: PathBuf,
    /// Root filesystem the container is jailed into.
    pub rootfs_path: PathBuf,
    /// Limits applied to the cgroup scope.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Volumes bind-mounted into the rootfs.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    /// Exit status of the command, when the runtime observed it.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ContainerRecord {
    /// Whether the record claims the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Command line joined with spaces.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A running record with every path below `dir`.
    pub fn record(id: &str, dir: &std::path::Path) -> ContainerRecord {
        ContainerRecord {
            id: ContainerId::new(id),
            pid: 4242,
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            command: vec!["/bin/sleep".into(), "60".into()],
            veth_host_name: None,
            veth_peer_name: None,
            container_ip: None,
            log_file_path: dir.join(format!("{id}.log")),
            detached: true,
            cgroup_path: dir.join("cgroup").join(id),
            rootfs_path: dir.join("rootfs"),
            limits: ResourceLimits::default(),
            volumes: Vec::new(),
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn new_record_is_running_with_joined_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let r = record("abc", dir.path());
        assert!(r.is_running());
        assert_eq!(r.command_line(), "/bin/sleep 60");
    }

    #[test]
    fn record_json_is_human_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut r = record("abc", dir.path());
        r.container_ip = Some(Ipv4Addr::new(10, 0, 0, 2));
        let json = serde_json::to_value(&r).expect("serialize");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["status"], "running");
        assert_eq!(json["container_ip"], "10.0.0.2");
        assert!(json["veth_host_name"].is_null());
    }

    #[test]
    fn optional_fields_may_be_absent_on_disk() {
        let json = r#"{
            "id": "abc",
            "pid": 7,
            "status": "exited",
            "created_at": "2024-01-02T03:04:05Z",
            "command": ["/bin/true"],
            "log_file_path": "/var/lib/nestbox/logs/abc.log",
            "detached": false,
            "cgroup_path": "/sys/fs/cgroup/nestbox/abc",
            "rootfs_path": "/rootfs"
        }"#;
        let r: ContainerRecord = serde_json::from_str(json).expect("parse");
        assert_eq!(r.status, ContainerStatus::Exited);
        assert_eq!(r.container_ip, None);
        assert!(r.volumes.is_empty());
    }
}
