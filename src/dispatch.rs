//! Reconciliation of kernel change events into switch-state transactions.
//!
//! Four handlers — link, route, neighbor, address — filter events down to
//! owned tap endpoints and submit copy-on-write mutations to the switch.
//! All handlers run on the listener worker; the switch serializes commits,
//! so concurrent state readers always observe a consistent snapshot.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::netlink::{
    Action, AddressEvent, Event, EventPayload, Family, LinkEvent, NeighborEvent, RouteEvent,
};
use crate::registry::EndpointRegistry;
use crate::state::{
    format_mac, InterfaceId, NeighborTable, RouteUpdater, SwitchHandle, Vlan, VlanId,
};
use crate::stats::BridgeStats;
use crate::tap::TapEndpoint;

/// Translates kernel change events into transactional switch-state updates.
pub struct ChangeDispatcher {
    registry: Arc<EndpointRegistry>,
    switch: Arc<SwitchHandle>,
    stats: Arc<BridgeStats>,
}

impl ChangeDispatcher {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        switch: Arc<SwitchHandle>,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            registry,
            switch,
            stats,
        }
    }

    pub fn dispatch(&self, event: Event) {
        match event.payload {
            EventPayload::Link(payload) => self.handle_link(event.action, payload),
            EventPayload::Route(payload) => self.handle_route(event.action, payload),
            EventPayload::Neighbor(payload) => self.handle_neighbor(event.action, payload),
            EventPayload::Address(payload) => self.handle_address(event.action, payload),
        }
    }

    /// Events for devices we do not own are discarded.
    fn owned_endpoint(&self, ifindex: u32) -> Option<&Arc<TapEndpoint>> {
        let endpoint = self.registry.by_index(ifindex);
        if endpoint.is_none() {
            debug!(ifindex, "event for foreign interface, ignoring");
        }
        endpoint
    }

    /// Fold a link update into the owned interface record.
    ///
    /// Only MAC and MTU are reconciled. Administrative state is ignored on
    /// purpose: an administratively-down tap has no routes to match, so the
    /// forwarding tables already decide reachability.
    fn handle_link(&self, action: Action, event: LinkEvent) {
        let Some(endpoint) = self.owned_endpoint(event.ifindex) else {
            return;
        };
        if action == Action::Delete {
            // Taps disappear only while we are shutting down.
            info!(name = %event.name, ifindex = event.ifindex, "ignoring link remove for owned tap");
            return;
        }

        let state = self.switch.current_state();
        let Some(interface) = state.interfaces().get(endpoint.interface_id()) else {
            warn!(name = %event.name, "no interface record for owned tap, ignoring link update");
            return;
        };

        let new_mac = event.mac.filter(|mac| *mac != interface.mac());
        let new_mtu = event.mtu.filter(|mtu| *mtu != interface.mtu());
        if new_mac.is_none() && new_mtu.is_none() {
            return;
        }
        if let Some(mac) = new_mac {
            info!(
                name = %event.name,
                old = %format_mac(&interface.mac()),
                new = %format_mac(&mac),
                "updating interface MAC"
            );
        }
        if let Some(mtu) = new_mtu {
            info!(name = %event.name, old = interface.mtu(), new = mtu, "updating interface MTU");
        }

        let interface_id = endpoint.interface_id();
        let label = format!("NetlinkListener update Interface {}", event.name);
        self.switch.update_state_blocking(&label, move |state| {
            let interface = state.interfaces().get(interface_id)?;
            let mut updated = interface.as_ref().clone();
            if let Some(mac) = new_mac {
                updated.set_mac(mac);
            }
            if let Some(mtu) = new_mtu {
                updated.set_mtu(mtu);
            }
            let mut interfaces = state.interfaces().clone();
            interfaces.insert(updated);
            let mut next = state.clone();
            next.reset_interfaces(interfaces);
            Some(next)
        });
    }

    /// Fold a route update into the owned router's tables.
    fn handle_route(&self, action: Action, event: RouteEvent) {
        let is_v4 = match event.family {
            Family::V4 => true,
            Family::V6 => false,
            Family::Other(family) => {
                info!(family, "unknown address family in route update, ignoring");
                return;
            }
        };
        let dst = event.dst.unwrap_or(if is_v4 {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });
        let prefix_len = event.prefix_len;
        debug!(dst = %dst, prefix_len, "route update");

        // The first next hop is canonical; it must carry a gateway and an
        // output interface that resolves to an owned endpoint.
        let Some(hop) = event.next_hops.first() else {
            info!(dst = %dst, prefix_len, "no next hop for route, ignoring");
            return;
        };
        let Some(gateway) = hop.gateway else {
            info!(dst = %dst, prefix_len, "next hop has no gateway, ignoring route");
            return;
        };
        let Some(oif) = hop.ifindex else {
            info!(dst = %dst, prefix_len, "next hop has no output interface, ignoring route");
            return;
        };
        let Some(endpoint) = self.owned_endpoint(oif) else {
            return;
        };
        let router = endpoint.router_id();
        debug!(
            ifindex = oif,
            router = %router,
            name = %endpoint.name(),
            gateway = %gateway,
            "next hop resolved to owned endpoint"
        );

        match action {
            Action::New => {
                if is_v4 {
                    self.stats.add_route_v4();
                } else {
                    self.stats.add_route_v6();
                }
                let mut next_hops = BTreeSet::new();
                next_hops.insert(gateway);
                self.switch.update_state_blocking("add route", move |state| {
                    let mut updater = RouteUpdater::new(state.route_tables());
                    if next_hops.is_empty() {
                        updater.add_drop_route(router, dst, prefix_len);
                    } else {
                        updater.add_route(router, dst, prefix_len, next_hops);
                    }
                    let new_tables = updater.update_done()?;
                    let mut next = state.clone();
                    next.reset_route_tables(new_tables);
                    Some(next)
                });
            }
            Action::Delete => {
                if is_v4 {
                    self.stats.del_route_v4();
                } else {
                    self.stats.del_route_v6();
                }
                self.switch
                    .update_state_blocking("delete route", move |state| {
                        let mut updater = RouteUpdater::new(state.route_tables());
                        updater.del_route(router, dst, prefix_len);
                        let new_tables = updater.update_done()?;
                        let mut next = state.clone();
                        next.reset_route_tables(new_tables);
                        Some(next)
                    });
            }
            Action::Change => {
                info!(dst = %dst, prefix_len, "route change not implemented, ignoring");
            }
        }
    }

    /// Fold a neighbor update into the VLAN's ARP or NDP table.
    fn handle_neighbor(&self, action: Action, event: NeighborEvent) {
        let name = event.link_name.as_deref().unwrap_or("<unknown>");
        let Some(endpoint) = self.owned_endpoint(event.ifindex) else {
            return;
        };
        let state = self.switch.current_state();
        let Some(interface) = state.interfaces().get(endpoint.interface_id()) else {
            warn!(name, "no interface record for owned tap, ignoring neighbor update");
            return;
        };

        let is_v4 = match event.family {
            Family::V4 => true,
            Family::V6 => false,
            Family::Other(family) => {
                info!(family, name, "unknown address family in neighbor update, ignoring");
                return;
            }
        };
        let (Some(dst), Some(mac)) = (event.dst, event.lladdr) else {
            warn!(
                name,
                ifindex = event.ifindex,
                "could not parse neighbor IP or MAC, ignoring"
            );
            return;
        };
        if action == Action::Change {
            info!(name, ip = %dst, "neighbor change not implemented, ignoring");
            return;
        }

        let vlan_id = interface.vlan();
        let interface_id = interface.id();
        // The v4 and v6 paths are the same reconciliation over different
        // tables.
        match (is_v4, dst) {
            (true, IpAddr::V4(ip)) => self.reconcile_neighbor(
                action,
                vlan_id,
                interface_id,
                ip,
                mac,
                Vlan::arp_table,
                Vlan::set_arp_table,
                "Adding new ARP entry",
                "Removing expired ARP entry",
            ),
            (false, IpAddr::V6(ip)) => self.reconcile_neighbor(
                action,
                vlan_id,
                interface_id,
                ip,
                mac,
                Vlan::ndp_table,
                Vlan::set_ndp_table,
                "Adding new NDP entry",
                "Removing expired NDP entry",
            ),
            _ => {
                warn!(name, ip = %dst, "neighbor family does not match its address, ignoring");
            }
        }
    }

    /// Shared add/remove path for ARP and NDP entries. The canonical egress
    /// port for a learned neighbor is the first port of the VLAN.
    #[allow(clippy::too_many_arguments)]
    fn reconcile_neighbor<A: Ord + Copy>(
        &self,
        action: Action,
        vlan_id: VlanId,
        interface_id: InterfaceId,
        ip: A,
        mac: [u8; 6],
        table: fn(&Vlan) -> &NeighborTable<A>,
        set_table: fn(&mut Vlan, NeighborTable<A>),
        add_label: &str,
        remove_label: &str,
    ) {
        match action {
            Action::New => {
                self.switch.update_state_blocking(add_label, move |state| {
                    let vlan = state.vlans().get(vlan_id)?;
                    let port = vlan.first_port()?;
                    let entries = table(vlan);
                    if let Some(entry) = entries.get(&ip) {
                        if entry.mac() == mac
                            && entry.port() == port
                            && entry.interface() == interface_id
                            && !entry.is_pending()
                        {
                            return None; // already there
                        }
                    }
                    let mut updated = entries.clone();
                    updated.add_entry(ip, mac, port, interface_id);
                    let mut new_vlan = vlan.as_ref().clone();
                    set_table(&mut new_vlan, updated);
                    let mut vlans = state.vlans().clone();
                    vlans.insert(new_vlan);
                    let mut next = state.clone();
                    next.reset_vlans(vlans);
                    Some(next)
                });
            }
            Action::Delete => {
                self.switch
                    .update_state_blocking(remove_label, move |state| {
                        let vlan = state.vlans().get(vlan_id)?;
                        if table(vlan).get(&ip).is_none() {
                            return None;
                        }
                        let mut updated = table(vlan).clone();
                        updated.remove(&ip);
                        let mut new_vlan = vlan.as_ref().clone();
                        set_table(&mut new_vlan, updated);
                        let mut vlans = state.vlans().clone();
                        vlans.insert(new_vlan);
                        let mut next = state.clone();
                        next.reset_vlans(vlans);
                        Some(next)
                    });
            }
            Action::Change => debug!("neighbor change filtered before reconciliation"),
        }
    }

    /// Fold an address update into the owned interface's address set.
    ///
    /// Addresses are normalized to address-only form; the prefix length is
    /// dropped because the tap is a point-to-host conduit, not a routed
    /// subnet participant.
    fn handle_address(&self, action: Action, event: AddressEvent) {
        let name = event.link_name.clone().unwrap_or_else(|| "<unknown>".to_string());
        let Some(endpoint) = self.owned_endpoint(event.ifindex) else {
            return;
        };
        let state = self.switch.current_state();
        let Some(interface) = state.interfaces().get(endpoint.interface_id()) else {
            warn!(name = %name, "no interface record for owned tap, ignoring address update");
            return;
        };

        if let Family::Other(family) = event.family {
            info!(family, name = %name, "unknown address family in address update, ignoring");
            return;
        }
        let Some(address) = event.local else {
            warn!(name = %name, ifindex = event.ifindex, "could not parse interface address, ignoring");
            return;
        };
        let interface_id = endpoint.interface_id();

        match action {
            Action::New => {
                if interface.has_address(&address) {
                    info!(address = %address, name = %name, "ignoring duplicate address add");
                    return;
                }
                let label = format!("Adding new IP address {address}");
                self.switch.update_state_blocking(&label, move |state| {
                    let interface = state.interfaces().get(interface_id)?;
                    let mut addresses = interface.addresses().clone();
                    debug!(address = %address, "adding address to interface");
                    addresses.insert(address);
                    let mut updated = interface.as_ref().clone();
                    updated.set_addresses(addresses);
                    let mut interfaces = state.interfaces().clone();
                    interfaces.insert(updated);
                    let mut next = state.clone();
                    next.reset_interfaces(interfaces);
                    Some(next)
                });
            }
            Action::Delete => {
                if !interface.has_address(&address) {
                    info!(address = %address, name = %name, "ignoring delete for unknown address");
                    return;
                }
                let label = format!("Deleting old IP address {address}");
                self.switch.update_state_blocking(&label, move |state| {
                    let interface = state.interfaces().get(interface_id)?;
                    let addresses = interface
                        .addresses()
                        .iter()
                        .copied()
                        .filter(|existing| *existing != address)
                        .collect();
                    debug!(address = %address, "removing address from interface");
                    let mut updated = interface.as_ref().clone();
                    updated.set_addresses(addresses);
                    let mut interfaces = state.interfaces().clone();
                    interfaces.insert(updated);
                    let mut next = state.clone();
                    next.reset_interfaces(interfaces);
                    Some(next)
                });
            }
            Action::Change => {
                info!(address = %address, name = %name, "address change not implemented, ignoring");
            }
        }
    }
}
