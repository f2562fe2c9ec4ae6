//! In-process mirrors of the kernel's link, route, neighbor, and address
//! tables.
//!
//! Each cache folds incremental kernel messages into its map and classifies
//! them: an object already present becomes a `Change`, an unknown one a
//! `New`, and RTM_DEL* messages a `Delete`. The caches are primed with full
//! kernel dumps at subscription time, so classification is meaningful from
//! the first notification on.

use std::collections::HashMap;
use std::net::IpAddr;

use super::event::{Action, AddressEvent, Family, LinkEvent, NeighborEvent, RouteEvent};

/// Mirror of the kernel link table, keyed by interface index.
#[derive(Debug, Default)]
pub struct LinkCache {
    entries: HashMap<u32, LinkEvent>,
}

impl LinkCache {
    /// Fold a kernel message into the cache and classify it.
    pub fn apply(&mut self, deleted: bool, event: &LinkEvent) -> Action {
        if deleted {
            self.entries.remove(&event.ifindex);
            Action::Delete
        } else if self.entries.insert(event.ifindex, event.clone()).is_some() {
            Action::Change
        } else {
            Action::New
        }
    }

    /// Resolve an interface index to its device name.
    pub fn name_of(&self, ifindex: u32) -> Option<&str> {
        self.entries.get(&ifindex).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mirror of the kernel route tables, keyed by destination prefix.
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: HashMap<(Family, Option<IpAddr>, u8), RouteEvent>,
}

impl RouteCache {
    pub fn apply(&mut self, deleted: bool, event: &RouteEvent) -> Action {
        if deleted {
            self.entries.remove(&event.key());
            Action::Delete
        } else if self.entries.insert(event.key(), event.clone()).is_some() {
            Action::Change
        } else {
            Action::New
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mirror of the kernel neighbor tables, keyed by interface and address.
#[derive(Debug, Default)]
pub struct NeighborCache {
    entries: HashMap<(u32, IpAddr), NeighborEvent>,
}

impl NeighborCache {
    pub fn apply(&mut self, deleted: bool, event: &NeighborEvent) -> Action {
        // Entries without a destination cannot be keyed; classify by message
        // type alone.
        let Some(dst) = event.dst else {
            return if deleted { Action::Delete } else { Action::New };
        };
        if deleted {
            self.entries.remove(&(event.ifindex, dst));
            Action::Delete
        } else if self
            .entries
            .insert((event.ifindex, dst), event.clone())
            .is_some()
        {
            Action::Change
        } else {
            Action::New
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mirror of the kernel address table, keyed by interface and address.
#[derive(Debug, Default)]
pub struct AddressCache {
    entries: HashMap<(u32, IpAddr), AddressEvent>,
}

impl AddressCache {
    pub fn apply(&mut self, deleted: bool, event: &AddressEvent) -> Action {
        let Some(local) = event.local else {
            return if deleted { Action::Delete } else { Action::New };
        };
        if deleted {
            self.entries.remove(&(event.ifindex, local));
            Action::Delete
        } else if self
            .entries
            .insert((event.ifindex, local), event.clone())
            .is_some()
        {
            Action::Change
        } else {
            Action::New
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(ifindex: u32, name: &str) -> LinkEvent {
        LinkEvent {
            ifindex,
            name: name.to_string(),
            mac: None,
            mtu: None,
            up: true,
        }
    }

    #[test]
    fn test_link_classification() {
        let mut cache = LinkCache::default();
        assert_eq!(cache.apply(false, &link(1, "tap1")), Action::New);
        assert_eq!(cache.apply(false, &link(1, "tap1")), Action::Change);
        assert_eq!(cache.name_of(1), Some("tap1"));
        assert_eq!(cache.apply(true, &link(1, "tap1")), Action::Delete);
        assert!(cache.is_empty());
        assert_eq!(cache.name_of(1), None);
    }

    #[test]
    fn test_neighbor_classification_keys_by_ifindex_and_ip() {
        let mut cache = NeighborCache::default();
        let event = NeighborEvent {
            ifindex: 42,
            family: Family::V4,
            link_name: None,
            dst: Some("192.168.1.5".parse().unwrap()),
            lladdr: Some([2, 0, 0, 0, 0, 1]),
        };
        assert_eq!(cache.apply(false, &event), Action::New);
        assert_eq!(cache.apply(false, &event), Action::Change);

        let other_ifindex = NeighborEvent {
            ifindex: 43,
            ..event.clone()
        };
        assert_eq!(cache.apply(false, &other_ifindex), Action::New);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_route_delete_of_unknown_is_still_delete() {
        let mut cache = RouteCache::default();
        let event = RouteEvent {
            family: Family::V4,
            dst: Some("10.0.0.0".parse().unwrap()),
            prefix_len: 24,
            next_hops: Vec::new(),
        };
        assert_eq!(cache.apply(true, &event), Action::Delete);
        assert!(cache.is_empty());
    }
}
