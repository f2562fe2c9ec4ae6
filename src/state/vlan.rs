//! VLAN records: port membership and the per-VLAN neighbor tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::neighbor::{ArpTable, NdpTable};
use super::{InterfaceId, PortId, VlanId};

/// One VLAN of the switch, with its member ports and neighbor tables.
#[derive(Debug, Clone)]
pub struct Vlan {
    id: VlanId,
    name: String,
    ports: BTreeSet<PortId>,
    interface: Option<InterfaceId>,
    arp_table: ArpTable,
    ndp_table: NdpTable,
}

impl Vlan {
    pub fn new(id: VlanId, name: String) -> Self {
        Self {
            id,
            name,
            ports: BTreeSet::new(),
            interface: None,
            arp_table: ArpTable::default(),
            ndp_table: NdpTable::default(),
        }
    }

    pub fn id(&self) -> VlanId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortId> {
        self.ports.iter()
    }

    pub fn add_port(&mut self, port: PortId) {
        self.ports.insert(port);
    }

    /// Canonical egress port for neighbor entries learned on this VLAN.
    pub fn first_port(&self) -> Option<PortId> {
        self.ports.iter().next().copied()
    }

    pub fn interface(&self) -> Option<InterfaceId> {
        self.interface
    }

    pub fn set_interface(&mut self, interface: InterfaceId) {
        self.interface = Some(interface);
    }

    pub fn arp_table(&self) -> &ArpTable {
        &self.arp_table
    }

    pub fn ndp_table(&self) -> &NdpTable {
        &self.ndp_table
    }

    pub fn set_arp_table(&mut self, table: ArpTable) {
        self.arp_table = table;
    }

    pub fn set_ndp_table(&mut self, table: NdpTable) {
        self.ndp_table = table;
    }
}

/// Snapshot map of VLANs, keyed by VLAN id.
#[derive(Debug, Clone, Default)]
pub struct VlanMap {
    vlans: BTreeMap<VlanId, Arc<Vlan>>,
}

impl VlanMap {
    pub fn get(&self, id: VlanId) -> Option<&Arc<Vlan>> {
        self.vlans.get(&id)
    }

    pub fn insert(&mut self, vlan: Vlan) {
        self.vlans.insert(vlan.id(), Arc::new(vlan));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vlan>> {
        self.vlans.values()
    }

    pub fn len(&self) -> usize {
        self.vlans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vlans.is_empty()
    }
}
