//! Container networking primitives.
//!
//! Every container is attached to one host-wide bridge through a veth pair:
//! the host end stays on the bridge, the peer end is moved into the
//! container's network namespace and configured from inside it. Addresses
//! come from a single /24 whose first host address belongs to the bridge.

pub mod child;
pub mod driver;
pub mod ipam;

use std::net::Ipv4Addr;

use nestbox_common::constants::MAX_IFNAME_LEN;
use nestbox_common::types::ContainerId;
use serde::{Deserialize, Serialize};

pub use driver::{IpCommand, NetworkDriver};
pub use ipam::IpPool;

/// Names of the two ends of a container's veth pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethPair {
    /// End attached to the bridge in the host namespace.
    pub host: String,
    /// End moved into the container namespace.
    pub peer: String,
}

impl VethPair {
    /// Derives interface names from the container id.
    ///
    /// Only the first eight id characters are used so both names fit the
    /// kernel's 15 character limit.
    #[must_use]
    pub fn for_container(id: &ContainerId) -> Self {
        let fragment = id.iface_fragment();
        Self {
            host: ifname(&format!("veth{fragment}")),
            peer: ifname(&format!("vethc{fragment}")),
        }
    }
}

fn ifname(name: &str) -> String {
    name.chars().take(MAX_IFNAME_LEN).collect()
}

/// What the isolated child needs to configure its own interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAssignment {
    /// Name the peer had when it was moved into the namespace.
    pub interface: String,
    /// Address assigned to the container.
    pub address: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// Default gateway, the bridge address.
    pub gateway: Ipv4Addr,
}

impl NetworkAssignment {
    /// The container address in CIDR notation.
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_fit_interface_limit() {
        let id = ContainerId::new("deadbeefcafebabe0123456789abcdef");
        let pair = VethPair::for_container(&id);
        assert_eq!(pair.host, "vethdeadbeef");
        assert_eq!(pair.peer, "vethcdeadbeef");
        assert!(pair.host.len() <= MAX_IFNAME_LEN);
        assert!(pair.peer.len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn short_ids_produce_short_names() {
        let pair = VethPair::for_container(&ContainerId::new("ab"));
        assert_eq!(pair.host, "vethab");
        assert_eq!(pair.peer, "vethcab");
    }

    #[test]
    fn assignment_cidr() {
        let a = NetworkAssignment {
            interface: "vethc1".into(),
            address: Ipv4Addr::new(10, 0, 0, 7),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
        };
        assert_eq!(a.cidr(), "10.0.0.7/24");
    }
}
