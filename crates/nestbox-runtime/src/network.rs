//! Host-side network resource manager.
//!
//! Owns the singleton bridge, its NAT rules, and per-container veth pairs.
//! Bridge and NAT setup are check-then-act and converge no matter how many
//! containers race through them; they are never torn down per container.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use nestbox_common::config::NetworkConfig;
use nestbox_common::error::Result;
use nestbox_common::types::ContainerId;
use nestbox_core::network::{IpCommand, NetworkAssignment, NetworkDriver, VethPair};

use crate::state::StateStore;

/// Manages the bridge, NAT, veth pairs and address leases.
pub struct NetworkManager {
    config: NetworkConfig,
    driver: Box<dyn NetworkDriver>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NetworkManager {
    /// Creates a manager that drives the host through `ip` and `iptables`.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_driver(config, Box::new(IpCommand::new()))
    }

    /// Creates a manager with a custom driver.
    #[must_use]
    pub fn with_driver(config: NetworkConfig, driver: Box<dyn NetworkDriver>) -> Self {
        Self { config, driver }
    }

    /// Network parameters in use.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Makes sure the bridge exists, is addressed and up, forwarding is on,
    /// and the NAT rules are present.
    ///
    /// Only a failure to create a missing bridge is returned; everything
    /// else degrades to a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge is absent and cannot be created.
    pub fn ensure_bridge(&self) -> Result<()> {
        let bridge = &self.config.bridge_name;
        if self.driver.link_exists(bridge) {
            tracing::debug!(bridge = %bridge, "bridge already present");
        } else {
            self.driver.create_bridge(bridge)?;
            tracing::info!(bridge = %bridge, "bridge created");
            if let Err(e) = self.driver.add_address(bridge, &self.config.bridge_cidr()) {
                tracing::warn!(bridge = %bridge, error = %e, "bridge address not assigned");
            }
        }
        if let Err(e) = self.driver.set_up(bridge) {
            tracing::warn!(bridge = %bridge, error = %e, "failed to bring bridge up");
        }
        if let Err(e) = self.driver.enable_forwarding() {
            tracing::warn!(error = %e, "failed to enable IP forwarding");
        }
        self.ensure_nat();
        Ok(())
    }

    fn ensure_nat(&self) {
        let egress = match self.driver.default_interface() {
            Ok(iface) => iface,
            Err(e) => {
                tracing::warn!(error = %e, "no default route, skipping NAT rules");
                return;
            }
        };
        let bridge = self.config.bridge_name.as_str();
        let subnet = self.config.cidr();
        let (subnet, egress) = (subnet.as_str(), egress.as_str());
        let rules: [(&str, &str, Vec<&str>); 3] = [
            (
                "nat",
                "POSTROUTING",
                vec!["-s", subnet, "-o", egress, "-j", "MASQUERADE"],
            ),
            ("filter", "FORWARD", vec!["-i", bridge, "-o", egress, "-j", "ACCEPT"]),
            (
                "filter",
                "FORWARD",
                vec![
                    "-i", egress, "-o", bridge, "-m", "state", "--state", "RELATED,ESTABLISHED",
                    "-j", "ACCEPT",
                ],
            ),
        ];
        for (table, chain, rule) in &rules {
            if let Err(e) = self.driver.ensure_rule(table, chain, rule) {
                tracing::warn!(table, chain, error = %e, "failed to install NAT rule");
            }
        }
    }

    /// Leases an address for `id`; repeated calls return the same address.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::PoolExhausted`](nestbox_common::error::NestboxError::PoolExhausted)
    /// if the subnet is full, or an error if the pool file is unusable.
    pub fn allocate_ip(&self, store: &StateStore, id: &ContainerId) -> Result<Ipv4Addr> {
        store.with_ipam(|pool| pool.allocate(id.as_str(), &self.config))
    }

    /// Creates the veth pair for `id`, attaches the host end to the bridge,
    /// and moves the peer into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created or the peer cannot be
    /// moved. A failure after creation deletes the pair again.
    pub fn setup_veth(&self, id: &ContainerId, pid: u32) -> Result<VethPair> {
        let pair = VethPair::for_container(id);
        self.driver.create_veth(&pair.host, &pair.peer)?;

        if let Err(e) = self.driver.attach_to_bridge(&pair.host, &self.config.bridge_name) {
            tracing::warn!(iface = %pair.host, error = %e, "failed to attach to bridge");
        }
        if let Err(e) = self.driver.set_up(&pair.host) {
            tracing::warn!(iface = %pair.host, error = %e, "failed to bring veth up");
        }

        let netns = PathBuf::from(format!("/proc/{pid}/ns/net"));
        if let Err(e) = self.driver.move_to_netns(&pair.peer, &netns) {
            self.delete_host_link(&pair.host);
            return Err(e);
        }
        tracing::info!(id = %id, host = %pair.host, peer = %pair.peer, "veth pair ready");
        Ok(pair)
    }

    /// Full host-side setup for a new container.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge, the address lease, or the veth pair
    /// could not be established; the lease is returned in that case.
    pub fn attach(&self, store: &StateStore, id: &ContainerId, pid: u32) -> Result<(VethPair, NetworkAssignment)> {
        self.ensure_bridge()?;
        let address = self.allocate_ip(store, id)?;
        let pair = match self.setup_veth(id, pid) {
            Ok(pair) => pair,
            Err(e) => {
                self.release_ip(store, id);
                return Err(e);
            }
        };
        let assignment = NetworkAssignment {
            interface: pair.peer.clone(),
            address,
            prefix_len: self.config.prefix_len,
            gateway: self.config.bridge_address(),
        };
        Ok((pair, assignment))
    }

    /// Deletes the host end of the pair and returns the address to the pool.
    ///
    /// Without a recorded interface no link is touched.
    /// Best-effort: an interface that is already gone or a pool that cannot
    /// be updated is logged and ignored. NAT rules are left intact.
    pub fn release(&self, store: &StateStore, id: &ContainerId, host_iface: Option<&str>) {
        if let Some(name) = host_iface {
            self.delete_host_link(name);
        }
        self.release_ip(store, id);
    }

    fn delete_host_link(&self, name: &str) {
        if !self.driver.link_exists(name) {
            return;
        }
        match self.driver.delete_link(name) {
            Ok(()) => tracing::debug!(iface = name, "veth deleted"),
            Err(e) => tracing::debug!(iface = name, error = %e, "veth not deleted"),
        }
    }

    fn release_ip(&self, store: &StateStore, id: &ContainerId) {
        if let Err(e) = store.with_ipam(|pool| Ok(pool.release(id.as_str()))) {
            tracing::warn!(id = %id, error = %e, "failed to release address");
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use nestbox_common::error::NestboxError;

    use super::*;

    /// Driver that records calls and simulates links in memory.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingDriver {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub links: Arc<Mutex<BTreeSet<String>>>,
        pub rules: Arc<Mutex<Vec<String>>>,
        pub fail_move: bool,
    }

    impl RecordingDriver {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NetworkDriver for RecordingDriver {
        fn link_exists(&self, name: &str) -> bool {
            self.links.lock().unwrap().contains(name)
        }

        fn create_bridge(&self, name: &str) -> Result<()> {
            self.log(format!("create_bridge {name}"));
            let _ = self.links.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        fn add_address(&self, dev: &str, cidr: &str) -> Result<()> {
            self.log(format!("add_address {dev} {cidr}"));
            Ok(())
        }

        fn set_up(&self, dev: &str) -> Result<()> {
            self.log(format!("set_up {dev}"));
            Ok(())
        }

        fn enable_forwarding(&self) -> Result<()> {
            self.log("enable_forwarding".into());
            Ok(())
        }

        fn default_interface(&self) -> Result<String> {
            Ok("eth0".into())
        }

        fn ensure_rule(&self, table: &str, chain: &str, rule: &[&str]) -> Result<()> {
            let rule = format!("{table} {chain} {}", rule.join(" "));
            let mut rules = self.rules.lock().unwrap();
            if !rules.contains(&rule) {
                rules.push(rule);
            }
            Ok(())
        }

        fn create_veth(&self, host: &str, peer: &str) -> Result<()> {
            self.log(format!("create_veth {host} {peer}"));
            let mut links = self.links.lock().unwrap();
            let _ = links.insert(host.to_string());
            let _ = links.insert(peer.to_string());
            Ok(())
        }

        fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()> {
            self.log(format!("attach {dev} {bridge}"));
            Ok(())
        }

        fn move_to_netns(&self, dev: &str, netns: &Path) -> Result<()> {
            if self.fail_move {
                return Err(NestboxError::Command {
                    program: "ip".into(),
                    message: "no such process".into(),
                });
            }
            self.log(format!("move {dev} {}", netns.display()));
            let _ = self.links.lock().unwrap().remove(dev);
            Ok(())
        }

        fn delete_link(&self, name: &str) -> Result<()> {
            self.log(format!("delete {name}"));
            let _ = self.links.lock().unwrap().remove(name);
            Ok(())
        }
    }
}
