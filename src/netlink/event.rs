//! Kernel change events decoded from routing-netlink messages.

use std::net::IpAddr;

use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::AddressFamily;

/// How the kernel changed an object, relative to the local caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    New,
    Change,
    Delete,
}

/// Address family as carried by a kernel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
    /// Any other kernel family; carried for diagnostics only.
    Other(u8),
}

impl From<AddressFamily> for Family {
    fn from(family: AddressFamily) -> Self {
        match family {
            AddressFamily::Inet => Family::V4,
            AddressFamily::Inet6 => Family::V6,
            other => Family::Other(u8::from(other)),
        }
    }
}

/// A single decoded change notification.
#[derive(Debug, Clone)]
pub struct Event {
    pub action: Action,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Link(LinkEvent),
    Route(RouteEvent),
    Neighbor(NeighborEvent),
    Address(AddressEvent),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub ifindex: u32,
    pub name: String,
    pub mac: Option<[u8; 6]>,
    pub mtu: Option<u32>,
    /// Administrative state. Kept for logging; reachability is decided by
    /// the forwarding tables alone.
    pub up: bool,
}

impl LinkEvent {
    pub fn from_message(msg: &LinkMessage) -> Self {
        let mut event = LinkEvent {
            ifindex: msg.header.index,
            name: String::new(),
            mac: None,
            mtu: None,
            up: msg.header.flags.contains(LinkFlags::Up),
        };
        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => event.name = name.clone(),
                LinkAttribute::Address(bytes) => {
                    event.mac = bytes.as_slice().try_into().ok();
                }
                LinkAttribute::Mtu(mtu) => event.mtu = Some(*mtu),
                _ => {}
            }
        }
        event
    }
}

/// One next hop of a kernel route.
#[derive(Debug, Clone)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    pub ifindex: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RouteEvent {
    pub family: Family,
    pub dst: Option<IpAddr>,
    pub prefix_len: u8,
    pub next_hops: Vec<NextHop>,
}

impl RouteEvent {
    pub fn from_message(msg: &RouteMessage) -> Self {
        let mut event = RouteEvent {
            family: msg.header.address_family.into(),
            dst: None,
            prefix_len: msg.header.destination_prefix_length,
            next_hops: Vec::new(),
        };
        let mut gateway = None;
        let mut oif = None;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => event.dst = route_address_to_ip(addr),
                RouteAttribute::Gateway(addr) => gateway = route_address_to_ip(addr),
                RouteAttribute::Oif(index) => oif = Some(*index),
                RouteAttribute::MultiPath(hops) => {
                    for hop in hops {
                        let gateway = hop.attributes.iter().find_map(|attr| match attr {
                            RouteAttribute::Gateway(addr) => route_address_to_ip(addr),
                            _ => None,
                        });
                        event.next_hops.push(NextHop {
                            gateway,
                            ifindex: Some(hop.interface_index),
                        });
                    }
                }
                _ => {}
            }
        }
        // Single-next-hop routes carry the gateway and output interface as
        // top-level attributes.
        if event.next_hops.is_empty() && (gateway.is_some() || oif.is_some()) {
            event.next_hops.push(NextHop {
                gateway,
                ifindex: oif,
            });
        }
        event
    }

    /// Cache key for reconciliation: destination prefix within a family.
    pub fn key(&self) -> (Family, Option<IpAddr>, u8) {
        (self.family, self.dst, self.prefix_len)
    }
}

#[derive(Debug, Clone)]
pub struct NeighborEvent {
    pub ifindex: u32,
    pub family: Family,
    /// Device name, resolved against the link cache at dispatch time.
    pub link_name: Option<String>,
    pub dst: Option<IpAddr>,
    pub lladdr: Option<[u8; 6]>,
}

impl NeighborEvent {
    pub fn from_message(msg: &NeighbourMessage) -> Self {
        let mut event = NeighborEvent {
            ifindex: msg.header.ifindex,
            family: msg.header.family.into(),
            link_name: None,
            dst: None,
            lladdr: None,
        };
        for attr in &msg.attributes {
            match attr {
                NeighbourAttribute::Destination(addr) => {
                    event.dst = match addr {
                        NeighbourAddress::Inet(a) => Some(IpAddr::V4(*a)),
                        NeighbourAddress::Inet6(a) => Some(IpAddr::V6(*a)),
                        _ => None,
                    };
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    event.lladdr = bytes.as_slice().try_into().ok();
                }
                _ => {}
            }
        }
        event
    }
}

#[derive(Debug, Clone)]
pub struct AddressEvent {
    pub ifindex: u32,
    pub family: Family,
    /// Device name, resolved against the link cache at dispatch time.
    pub link_name: Option<String>,
    /// The host's address on the interface, in address-only form.
    pub local: Option<IpAddr>,
    pub prefix_len: u8,
}

impl AddressEvent {
    pub fn from_message(msg: &AddressMessage) -> Self {
        let mut event = AddressEvent {
            ifindex: msg.header.index,
            family: msg.header.family.into(),
            link_name: None,
            local: None,
            prefix_len: msg.header.prefix_len,
        };
        let mut address = None;
        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Local(addr) => event.local = Some(*addr),
                AddressAttribute::Address(addr) => address = Some(*addr),
                _ => {}
            }
        }
        // v6 addresses come without IFA_LOCAL; the interface address is the
        // host address there.
        if event.local.is_none() {
            event.local = address;
        }
        event
    }
}

fn route_address_to_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(a) => Some(IpAddr::V4(*a)),
        RouteAddress::Inet6(a) => Some(IpAddr::V6(*a)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_link_event_from_message() {
        let mut msg = LinkMessage::default();
        msg.header.index = 42;
        msg.header.flags = LinkFlags::Up;
        msg.attributes.push(LinkAttribute::IfName("tap1".to_string()));
        msg.attributes
            .push(LinkAttribute::Address(vec![0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]));
        msg.attributes.push(LinkAttribute::Mtu(1500));

        let event = LinkEvent::from_message(&msg);
        assert_eq!(event.ifindex, 42);
        assert_eq!(event.name, "tap1");
        assert_eq!(event.mac, Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]));
        assert_eq!(event.mtu, Some(1500));
        assert!(event.up);
    }

    #[test]
    fn test_route_event_single_next_hop() {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet;
        msg.header.destination_prefix_length = 24;
        msg.attributes.push(RouteAttribute::Destination(RouteAddress::Inet(
            Ipv4Addr::new(10, 0, 0, 0),
        )));
        msg.attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet(Ipv4Addr::new(10, 1, 1, 1))));
        msg.attributes.push(RouteAttribute::Oif(42));

        let event = RouteEvent::from_message(&msg);
        assert_eq!(event.family, Family::V4);
        assert_eq!(event.dst, Some("10.0.0.0".parse().unwrap()));
        assert_eq!(event.prefix_len, 24);
        assert_eq!(event.next_hops.len(), 1);
        assert_eq!(event.next_hops[0].gateway, Some("10.1.1.1".parse().unwrap()));
        assert_eq!(event.next_hops[0].ifindex, Some(42));
    }

    #[test]
    fn test_route_event_without_next_hop() {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet;
        msg.header.destination_prefix_length = 32;
        msg.attributes.push(RouteAttribute::Destination(RouteAddress::Inet(
            Ipv4Addr::new(10, 0, 0, 1),
        )));

        let event = RouteEvent::from_message(&msg);
        assert!(event.next_hops.is_empty());
    }

    #[test]
    fn test_neighbor_event_from_message() {
        let mut msg = NeighbourMessage::default();
        msg.header.ifindex = 42;
        msg.header.family = AddressFamily::Inet;
        msg.attributes.push(NeighbourAttribute::Destination(
            NeighbourAddress::Inet(Ipv4Addr::new(192, 168, 1, 5)),
        ));
        msg.attributes.push(NeighbourAttribute::LinkLocalAddress(vec![
            0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        ]));

        let event = NeighborEvent::from_message(&msg);
        assert_eq!(event.ifindex, 42);
        assert_eq!(event.family, Family::V4);
        assert_eq!(event.dst, Some("192.168.1.5".parse().unwrap()));
        assert_eq!(event.lladdr, Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]));
    }

    #[test]
    fn test_address_event_prefers_local() {
        let mut msg = AddressMessage::default();
        msg.header.index = 42;
        msg.header.family = AddressFamily::Inet;
        msg.header.prefix_len = 24;
        msg.attributes
            .push(AddressAttribute::Address("10.0.0.2".parse().unwrap()));
        msg.attributes
            .push(AddressAttribute::Local("10.0.0.1".parse().unwrap()));

        let event = AddressEvent::from_message(&msg);
        assert_eq!(event.local, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(event.prefix_len, 24);
    }
}
