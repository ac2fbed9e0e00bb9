//! Container address pool.
//!
//! The pool is plain data: persistence and locking belong to the state
//! repository, which hands a loaded pool to a closure under an exclusive
//! lock and writes it back afterwards.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use nestbox_common::config::NetworkConfig;
use nestbox_common::constants::{FIRST_CONTAINER_OCTET, LAST_CONTAINER_OCTET};
use nestbox_common::error::{NestboxError, Result};
use serde::{Deserialize, Serialize};

/// Host octets handed out to containers in the /24.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    /// Container id to assigned address.
    pub allocated: BTreeMap<String, Ipv4Addr>,
    /// Host octet the next scan starts from.
    pub next_candidate: u8,
}

impl Default for IpPool {
    fn default() -> Self {
        Self {
            allocated: BTreeMap::new(),
            next_candidate: FIRST_CONTAINER_OCTET,
        }
    }
}

impl IpPool {
    /// Returns the address for `container_id`, assigning one if needed.
    ///
    /// Calling this again for the same id returns the same address. New
    /// addresses are found by a first-fit scan that starts at the cursor and
    /// wraps from `.254` back to `.2`, so released addresses are reused once
    /// the top of the range has been reached.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::PoolExhausted`] when every container address
    /// is taken.
    pub fn allocate(&mut self, container_id: &str, net: &NetworkConfig) -> Result<Ipv4Addr> {
        if let Some(ip) = self.allocated.get(container_id) {
            return Ok(*ip);
        }

        let start = self.cursor();
        for offset in 0..Self::capacity() {
            let octet = wrap(start, offset);
            let candidate = net.host(octet);
            if self.allocated.values().any(|ip| *ip == candidate) {
                continue;
            }
            let _ = self.allocated.insert(container_id.to_string(), candidate);
            self.next_candidate = wrap(octet, 1);
            tracing::debug!(id = container_id, ip = %candidate, "address allocated");
            return Ok(candidate);
        }

        Err(NestboxError::PoolExhausted { subnet: net.cidr() })
    }

    /// Returns the address held by `container_id` to the pool.
    pub fn release(&mut self, container_id: &str) -> Option<Ipv4Addr> {
        let ip = self.allocated.remove(container_id);
        if let Some(ip) = ip {
            tracing::debug!(id = container_id, %ip, "address released");
        }
        ip
    }

    /// Address currently held by `container_id`, if any.
    #[must_use]
    pub fn get(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.allocated.get(container_id).copied()
    }

    /// Number of addresses available to containers.
    #[must_use]
    pub const fn capacity() -> u8 {
        LAST_CONTAINER_OCTET - FIRST_CONTAINER_OCTET + 1
    }

    fn cursor(&self) -> u8 {
        if (FIRST_CONTAINER_OCTET..=LAST_CONTAINER_OCTET).contains(&self.next_candidate) {
            self.next_candidate
        } else {
            FIRST_CONTAINER_OCTET
        }
    }
}

fn wrap(octet: u8, offset: u8) -> u8 {
    let span = u16::from(IpPool::capacity());
    let index = (u16::from(octet - FIRST_CONTAINER_OCTET) + u16::from(offset)) % span;
    // index < span <= 253, so the sum stays within u8.
    FIRST_CONTAINER_OCTET + u8::try_from(index).unwrap_or(0)
}
