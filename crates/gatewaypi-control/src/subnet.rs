//! Tunnel subnet allocation
//!
//! Carves the configured private pool into /24 slots. Slot 0 belongs to the
//! VPS hub; gateways get the lowest free slot and give it back on removal.

use crate::error::{ControlError, Result};
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

const SLOT_PREFIX: u8 = 24;

/// /24 allocator over a private pool
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    pool: Ipv4Network,
    allocated: BTreeSet<u32>,
}

impl SubnetAllocator {
    pub fn new(pool: Ipv4Network) -> Result<Self> {
        if pool.prefix() > SLOT_PREFIX {
            return Err(ControlError::Config(format!("tunnel pool {} is smaller than a /24", pool)));
        }
        Ok(Self {
            pool,
            allocated: BTreeSet::new(),
        })
    }

    fn slot_count(&self) -> u32 {
        1u32 << (SLOT_PREFIX - self.pool.prefix())
    }

    fn subnet_for(&self, slot: u32) -> Ipv4Network {
        let base = u32::from(self.pool.network()) + (slot << (32 - SLOT_PREFIX));
        Ipv4Network::new(Ipv4Addr::from(base), SLOT_PREFIX)
            .expect("/24 prefix is always valid")
    }

    fn slot_of(&self, subnet: Ipv4Network) -> Option<u32> {
        if subnet.prefix() != SLOT_PREFIX || !self.pool.contains(subnet.network()) {
            return None;
        }
        let offset = u32::from(subnet.network()) - u32::from(self.pool.network());
        Some(offset >> (32 - SLOT_PREFIX))
    }

    /// Subnet of the VPS side of every tunnel
    pub fn hub_subnet(&self) -> Ipv4Network {
        self.subnet_for(0)
    }

    /// Claim the lowest free /24
    pub fn allocate(&mut self) -> Result<Ipv4Network> {
        let slot = (1..self.slot_count())
            .find(|slot| !self.allocated.contains(slot))
            .ok_or(ControlError::SubnetPoolExhausted)?;
        self.allocated.insert(slot);
        Ok(self.subnet_for(slot))
    }

    /// Return a /24 to the pool
    pub fn release(&mut self, subnet: Ipv4Network) -> bool {
        match self.slot_of(subnet) {
            Some(slot) => self.allocated.remove(&slot),
            None => false,
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.len()
    }
}

/// First host address of a subnet
pub fn first_host(subnet: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> SubnetAllocator {
        SubnetAllocator::new(cidr.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_allocations_are_unique_and_skip_hub() {
        let mut allocator = pool("10.0.0.0/16");
        assert_eq!(allocator.hub_subnet().to_string(), "10.0.0.0/24");

        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_eq!(first.to_string(), "10.0.1.0/24");
        assert_eq!(second.to_string(), "10.0.2.0/24");
        assert_eq!(first_host(first), Ipv4Addr::new(10, 0, 1, 1));
    }

    #[test]
    fn test_release_reuses_lowest_slot() {
        let mut allocator = pool("10.0.0.0/16");
        let first = allocator.allocate().unwrap();
        allocator.allocate().unwrap();

        assert!(allocator.release(first));
        assert!(!allocator.release(first));
        assert_eq!(allocator.allocate().unwrap(), first);
    }

    #[test]
    fn test_exhaustion() {
        // /22 holds four /24s, one of them is the hub
        let mut allocator = pool("172.16.0.0/22");
        for _ in 0..3 {
            allocator.allocate().unwrap();
        }
        assert!(matches!(allocator.allocate(), Err(ControlError::SubnetPoolExhausted)));
        assert_eq!(allocator.allocated(), 3);
    }

    #[test]
    fn test_foreign_subnet_release_ignored() {
        let mut allocator = pool("10.0.0.0/16");
        assert!(!allocator.release("192.168.1.0/24".parse().unwrap()));
    }
}
