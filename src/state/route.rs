//! Per-router route tables and the transactional route updater.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use tracing::warn;

use super::RouterId;

/// Forwarding behavior of one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Forward via the given next-hop gateways.
    Forward(BTreeSet<IpAddr>),
    /// Discard matching packets.
    Drop,
}

/// Unicast tables of one router, v4 and v6.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    v4: PrefixMap<Ipv4Net, RouteAction>,
    v6: PrefixMap<Ipv6Net, RouteAction>,
}

impl RouteTable {
    pub fn get_v4(&self, prefix: &Ipv4Net) -> Option<&RouteAction> {
        self.v4.get(prefix)
    }

    pub fn get_v6(&self, prefix: &Ipv6Net) -> Option<&RouteAction> {
        self.v6.get(prefix)
    }

    /// Longest-prefix match for a v4 destination.
    pub fn lookup_v4(&self, addr: Ipv4Addr) -> Option<&RouteAction> {
        self.v4.get_lpm(&Ipv4Net::from(addr)).map(|(_, action)| action)
    }

    /// Longest-prefix match for a v6 destination.
    pub fn lookup_v6(&self, addr: Ipv6Addr) -> Option<&RouteAction> {
        self.v6.get_lpm(&Ipv6Net::from(addr)).map(|(_, action)| action)
    }

    pub fn len(&self) -> usize {
        self.v4.iter().count() + self.v6.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Route tables for all routers, keyed by router id.
#[derive(Debug, Clone, Default)]
pub struct RouteTables {
    tables: BTreeMap<RouterId, RouteTable>,
}

impl RouteTables {
    pub fn table(&self, router: RouterId) -> Option<&RouteTable> {
        self.tables.get(&router)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Transactional editor over a route-tables snapshot.
///
/// Edits accumulate on a private copy; [`RouteUpdater::update_done`] hands
/// the copy back only if something actually changed, so callers can skip
/// committing no-op updates.
pub struct RouteUpdater {
    tables: RouteTables,
    changed: bool,
}

impl RouteUpdater {
    pub fn new(tables: &RouteTables) -> Self {
        Self {
            tables: tables.clone(),
            changed: false,
        }
    }

    /// Install a route forwarding to `next_hops`.
    pub fn add_route(
        &mut self,
        router: RouterId,
        dst: IpAddr,
        prefix_len: u8,
        next_hops: BTreeSet<IpAddr>,
    ) {
        self.set_route(router, dst, prefix_len, RouteAction::Forward(next_hops));
    }

    /// Install a route that discards matching packets.
    pub fn add_drop_route(&mut self, router: RouterId, dst: IpAddr, prefix_len: u8) {
        self.set_route(router, dst, prefix_len, RouteAction::Drop);
    }

    fn set_route(&mut self, router: RouterId, dst: IpAddr, prefix_len: u8, action: RouteAction) {
        let table = self.tables.tables.entry(router).or_default();
        match dst {
            IpAddr::V4(addr) => {
                let Ok(net) = Ipv4Net::new(addr, prefix_len) else {
                    warn!(%dst, prefix_len, "invalid v4 route prefix, skipping");
                    return;
                };
                let previous = table.v4.insert(net.trunc(), action.clone());
                self.changed |= previous != Some(action);
            }
            IpAddr::V6(addr) => {
                let Ok(net) = Ipv6Net::new(addr, prefix_len) else {
                    warn!(%dst, prefix_len, "invalid v6 route prefix, skipping");
                    return;
                };
                let previous = table.v6.insert(net.trunc(), action.clone());
                self.changed |= previous != Some(action);
            }
        }
    }

    /// Remove the route for `(router, dst, prefix_len)` if present.
    pub fn del_route(&mut self, router: RouterId, dst: IpAddr, prefix_len: u8) {
        let Some(table) = self.tables.tables.get_mut(&router) else {
            return;
        };
        match dst {
            IpAddr::V4(addr) => {
                let Ok(net) = Ipv4Net::new(addr, prefix_len) else {
                    warn!(%dst, prefix_len, "invalid v4 route prefix, skipping");
                    return;
                };
                self.changed |= table.v4.remove(&net.trunc()).is_some();
            }
            IpAddr::V6(addr) => {
                let Ok(net) = Ipv6Net::new(addr, prefix_len) else {
                    warn!(%dst, prefix_len, "invalid v6 route prefix, skipping");
                    return;
                };
                self.changed |= table.v6.remove(&net.trunc()).is_some();
            }
        }
    }

    /// Finish the edit. Returns the new tables, or `None` when nothing
    /// changed.
    pub fn update_done(self) -> Option<RouteTables> {
        self.changed.then_some(self.tables)
    }
}
