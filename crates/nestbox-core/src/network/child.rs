//! Interface configuration from inside the container's network namespace.

use nestbox_common::error::Result;

use super::NetworkAssignment;
use super::driver::{IpCommand, NetworkDriver};

/// Brings up loopback and the container's veth end, then routes through
/// the bridge.
///
/// The peer is looked up by type because a moved interface may be renamed;
/// if the scan finds nothing the assigned name is used as is. Failing to add
/// the address or the route is logged and tolerated, leaving the container
/// with partial connectivity.
///
/// # Errors
///
/// Returns an error if the veth cannot be brought up.
pub fn configure_self(assignment: &NetworkAssignment) -> Result<()> {
    let ip = IpCommand::new();
    if let Err(e) = ip.set_up("lo") {
        tracing::warn!(error = %e, "failed to bring up loopback");
    }

    let iface = match ip.ip(&["-o", "link", "show", "type", "veth"]) {
        Ok(out) => first_veth(&out),
        Err(e) => {
            tracing::warn!(error = %e, "veth scan failed");
            None
        }
    }
    .unwrap_or_else(|| {
        tracing::warn!(iface = %assignment.interface, "no veth found by scan, using assigned name");
        assignment.interface.clone()
    });

    ip.set_up(&iface)?;
    if let Err(e) = ip.add_address(&iface, &assignment.cidr()) {
        tracing::warn!(iface = %iface, error = %e, "failed to assign address");
    }
    let gateway = assignment.gateway.to_string();
    if let Err(e) = ip.ip(&["route", "add", "default", "via", &gateway]) {
        tracing::warn!(gateway = %gateway, error = %e, "failed to add default route");
    }

    tracing::info!(iface = %iface, ip = %assignment.address, "container network configured");
    Ok(())
}

/// First interface name in `ip -o link show` output, without the `@ifN`
/// peer suffix, e.g. `2: vethc1a2b3c4d@if7: <BROADCAST,...>`.
fn first_veth(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let name = line.split(':').nth(1)?.trim();
        let name = name.split('@').next().unwrap_or(name);
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_suffix_is_stripped() {
        let out = "7: vethc1a2b3c4d@if8: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN\n";
        assert_eq!(first_veth(out).as_deref(), Some("vethc1a2b3c4d"));
    }

    #[test]
    fn name_without_suffix_is_kept() {
        let out = "3: eth0: <BROADCAST,MULTICAST,UP> mtu 1500\n";
        assert_eq!(first_veth(out).as_deref(), Some("eth0"));
    }

    #[test]
    fn first_of_several_interfaces_wins() {
        let out = "4: vethcaaaa@if5: <...>\n6: vethcbbbb@if7: <...>\n";
        assert_eq!(first_veth(out).as_deref(), Some("vethcaaaa"));
    }

    #[test]
    fn empty_scan_yields_none() {
        assert_eq!(first_veth(""), None);
        assert_eq!(first_veth("garbage\n"), None);
    }
}
