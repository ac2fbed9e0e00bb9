//! Kernel-facing network operations.
//!
//! [`NetworkDriver`] is the seam between the network manager's bookkeeping
//! and the host's networking stack. [`IpCommand`] implements it by shelling
//! out to `ip(8)` and `iptables(8)`.

use std::path::{Path, PathBuf};
use std::process::Command;

use nestbox_common::error::{NestboxError, Result};

const SYS_CLASS_NET: &str = "/sys/class/net";
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// Host-side link, address, and firewall operations.
pub trait NetworkDriver: Send + Sync {
    /// Whether an interface with this name exists in the host namespace.
    fn link_exists(&self, name: &str) -> bool;

    /// Creates a bridge interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be created.
    fn create_bridge(&self, name: &str) -> Result<()>;

    /// Assigns an address (CIDR notation) to an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be added, including when it
    /// is already present.
    fn add_address(&self, dev: &str, cidr: &str) -> Result<()>;

    /// Brings an interface up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link state cannot be changed.
    fn set_up(&self, dev: &str) -> Result<()>;

    /// Enables IPv4 forwarding on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysctl cannot be written.
    fn enable_forwarding(&self) -> Result<()>;

    /// Name of the interface carrying the host's default route.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no default route.
    fn default_interface(&self) -> Result<String>;

    /// Appends a firewall rule unless an identical rule already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule is missing and cannot be appended.
    fn ensure_rule(&self, table: &str, chain: &str, rule: &[&str]) -> Result<()>;

    /// Creates a veth pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created.
    fn create_veth(&self, host: &str, peer: &str) -> Result<()>;

    /// Enslaves an interface to a bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be set.
    fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()>;

    /// Moves an interface into the network namespace at `netns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be moved.
    fn move_to_netns(&self, dev: &str, netns: &Path) -> Result<()>;

    /// Deletes an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be deleted.
    fn delete_link(&self, name: &str) -> Result<()>;
}

/// Driver backed by the `ip` and `iptables` command-line tools.
#[derive(Debug, Clone)]
pub struct IpCommand {
    ip: PathBuf,
    iptables: PathBuf,
}

impl IpCommand {
    /// Locates the tools on `PATH`, falling back to bare names.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ip: locate("ip"),
            iptables: locate("iptables"),
        }
    }

    /// Runs `ip` with the given arguments and returns its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::Command`] if the tool cannot be spawned or
    /// exits unsuccessfully.
    pub fn ip(&self, args: &[&str]) -> Result<String> {
        run(&self.ip, args)
    }

    fn iptables(&self, args: &[&str]) -> Result<String> {
        run(&self.iptables, args)
    }
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn locate(tool: &str) -> PathBuf {
    which::which(tool)
        .or_else(|_| which::which_in(tool, Some("/usr/sbin:/sbin:/usr/bin:/bin"), "/"))
        .unwrap_or_else(|_| PathBuf::from(tool))
}

fn run(program: &Path, args: &[&str]) -> Result<String> {
    let name = program.display().to_string();
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| NestboxError::Command {
            program: name.clone(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(NestboxError::Command {
            program: name,
            message: format!(
                "{} ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl NetworkDriver for IpCommand {
    fn link_exists(&self, name: &str) -> bool {
        Path::new(SYS_CLASS_NET).join(name).exists()
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", "name", name, "type", "bridge"])
            .map(drop)
    }

    fn add_address(&self, dev: &str, cidr: &str) -> Result<()> {
        self.ip(&["addr", "add", cidr, "dev", dev]).map(drop)
    }

    fn set_up(&self, dev: &str) -> Result<()> {
        self.ip(&["link", "set", dev, "up"]).map(drop)
    }

    fn enable_forwarding(&self) -> Result<()> {
        std::fs::write(IP_FORWARD, "1").map_err(|e| NestboxError::io(IP_FORWARD, e))
    }

    fn default_interface(&self) -> Result<String> {
        let routes = self.ip(&["route", "show", "default"])?;
        parse_default_interface(&routes).ok_or_else(|| NestboxError::NotFound {
            kind: "default route",
            id: "default".into(),
        })
    }

    fn ensure_rule(&self, table: &str, chain: &str, rule: &[&str]) -> Result<()> {
        let check: Vec<&str> = ["-t", table, "-C", chain]
            .into_iter()
            .chain(rule.iter().copied())
            .collect();
        if self.iptables(&check).is_ok() {
            return Ok(());
        }
        let append: Vec<&str> = ["-t", table, "-A", chain]
            .into_iter()
            .chain(rule.iter().copied())
            .collect();
        self.iptables(&append)?;
        tracing::debug!(table, chain, rule = ?rule, "firewall rule added");
        Ok(())
    }

    fn create_veth(&self, host: &str, peer: &str) -> Result<()> {
        self.ip(&["link", "add", host, "type", "veth", "peer", "name", peer])
            .map(drop)
    }

    fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()> {
        self.ip(&["link", "set", dev, "master", bridge]).map(drop)
    }

    fn move_to_netns(&self, dev: &str, netns: &Path) -> Result<()> {
        let netns = netns.display().to_string();
        self.ip(&["link", "set", dev, "netns", &netns]).map(drop)
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", name]).map(drop)
    }
}

/// Extracts the device from `ip route show default` output,
/// e.g. `default via 192.168.1.1 dev eth0 proto dhcp`.
fn parse_default_interface(routes: &str) -> Option<String> {
    routes
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "dev")?;
            words.next().map(str::to_string)
        })
}
