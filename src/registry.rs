//! Dual-index registry over tap endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::state::VlanId;
use crate::tap::TapEndpoint;

/// Index of live tap endpoints, keyed by kernel interface index and by VLAN.
///
/// Populated on the bootstrap thread during the initial fan-out and
/// read-only for the listener and pump workers afterwards, so lookups take
/// no locks. Every endpoint appears in both maps or in neither; the ifindex
/// map is the owning view and drives destruction order.
#[derive(Default)]
pub struct EndpointRegistry {
    by_ifindex: HashMap<u32, Arc<TapEndpoint>>,
    by_vlan: HashMap<VlanId, Arc<TapEndpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, endpoint: TapEndpoint) {
        let endpoint = Arc::new(endpoint);
        debug!(
            name = %endpoint.name(),
            ifindex = endpoint.ifindex(),
            vlan = %endpoint.vlan(),
            "registering tap endpoint"
        );
        self.by_ifindex.insert(endpoint.ifindex(), endpoint.clone());
        self.by_vlan.insert(endpoint.vlan(), endpoint);
    }

    pub fn by_index(&self, ifindex: u32) -> Option<&Arc<TapEndpoint>> {
        self.by_ifindex.get(&ifindex)
    }

    pub fn by_vlan(&self, vlan: VlanId) -> Option<&Arc<TapEndpoint>> {
        self.by_vlan.get(&vlan)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TapEndpoint>> {
        self.by_ifindex.values()
    }

    pub fn len(&self) -> usize {
        self.by_ifindex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ifindex.is_empty()
    }

    /// Close every endpoint without touching the indexes. Used when the
    /// registry is still shared at shutdown.
    pub fn close_all(&self) {
        for endpoint in self.by_ifindex.values() {
            endpoint.close();
        }
    }

    /// Drain the owning index, closing each endpoint, then drop the VLAN
    /// aliases.
    pub fn clear(&mut self) {
        for (_, endpoint) in self.by_ifindex.drain() {
            info!(name = %endpoint.name(), "releasing tap endpoint");
            endpoint.close();
        }
        if !self.by_ifindex.is_empty() {
            warn!("endpoint index not fully drained, clearing leftovers");
            self.by_ifindex.clear();
        }
        self.by_vlan.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InterfaceId, RouterId};
    use std::fs::File;

    fn endpoint(ifindex: u32, vlan: u16) -> TapEndpoint {
        let (read_end, _) = nix::unistd::pipe().unwrap();
        TapEndpoint::from_file(
            File::from(read_end),
            format!("tap{vlan}"),
            ifindex,
            RouterId(0),
            InterfaceId(u32::from(vlan)),
            VlanId(vlan),
        )
    }

    #[test]
    fn test_both_indexes_resolve_the_same_endpoint() {
        let mut registry = EndpointRegistry::new();
        registry.insert(endpoint(42, 1));
        registry.insert(endpoint(43, 2));
        assert_eq!(registry.len(), 2);

        let by_index = registry.by_index(42).unwrap();
        let by_vlan = registry.by_vlan(VlanId(1)).unwrap();
        assert!(Arc::ptr_eq(by_index, by_vlan));
        assert!(registry.by_index(7).is_none());
        assert!(registry.by_vlan(VlanId(9)).is_none());
    }

    #[test]
    fn test_clear_closes_and_empties() {
        let mut registry = EndpointRegistry::new();
        registry.insert(endpoint(42, 1));
        let held = registry.by_index(42).unwrap().clone();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.by_vlan(VlanId(1)).is_none());
        assert!(!held.is_open());
    }
}
