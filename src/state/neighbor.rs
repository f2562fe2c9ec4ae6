//! ARP and NDP neighbor tables.
//!
//! The two tables are the same structure over different address types; the
//! dispatcher drives them through a shared generic path.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{InterfaceId, PortId};

/// One resolved L3-to-L2 binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    mac: [u8; 6],
    port: PortId,
    interface: InterfaceId,
    pending: bool,
}

impl NeighborEntry {
    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    /// A pending entry is a resolution in flight; it has no usable MAC yet.
    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Neighbor table keyed by IP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborTable<A: Ord> {
    entries: BTreeMap<A, NeighborEntry>,
}

impl<A: Ord> Default for NeighborTable<A> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

pub type ArpTable = NeighborTable<Ipv4Addr>;
pub type NdpTable = NeighborTable<Ipv6Addr>;

impl<A: Ord + Copy> NeighborTable<A> {
    pub fn get(&self, ip: &A) -> Option<&NeighborEntry> {
        self.entries.get(ip)
    }

    /// Insert or overwrite a resolved entry.
    pub fn add_entry(&mut self, ip: A, mac: [u8; 6], port: PortId, interface: InterfaceId) {
        self.entries.insert(
            ip,
            NeighborEntry {
                mac,
                port,
                interface,
                pending: false,
            },
        );
    }

    /// Insert a pending entry for a resolution in flight.
    pub fn add_pending_entry(&mut self, ip: A, port: PortId, interface: InterfaceId) {
        self.entries.insert(
            ip,
            NeighborEntry {
                mac: [0; 6],
                port,
                interface,
                pending: true,
            },
        );
    }

    /// Remove the entry for `ip`; returns whether one existed.
    pub fn remove(&mut self, ip: &A) -> bool {
        self.entries.remove(ip).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&A, &NeighborEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let mut table = ArpTable::default();
        let ip: Ipv4Addr = "192.168.1.5".parse().unwrap();
        table.add_entry(ip, [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee], PortId(1), InterfaceId(10));
        assert_eq!(table.len(), 1);
        let entry = table.get(&ip).unwrap();
        assert!(!entry.is_pending());
        assert_eq!(entry.port(), PortId(1));
        assert!(table.remove(&ip));
        assert!(!table.remove(&ip));
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolved_entry_overwrites_pending() {
        let mut table = NdpTable::default();
        let ip: Ipv6Addr = "fe80::1".parse().unwrap();
        table.add_pending_entry(ip, PortId(1), InterfaceId(10));
        assert!(table.get(&ip).unwrap().is_pending());
        table.add_entry(ip, [0x02, 0, 0, 0, 0, 0x05], PortId(1), InterfaceId(10));
        let entry = table.get(&ip).unwrap();
        assert!(!entry.is_pending());
        assert_eq!(entry.mac(), [0x02, 0, 0, 0, 0, 0x05]);
    }
}
