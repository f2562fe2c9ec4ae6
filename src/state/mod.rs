//! Switch-state collaborator: an immutable forwarding-state snapshot tree
//! and the transactional handle the bridge submits mutations through.
//!
//! - `SwitchState`: point-in-time snapshot of interfaces, VLANs (with their
//!   ARP/NDP tables), and route tables
//! - `SwitchHandle`: shared access with wait-free reads and serialized,
//!   commit-or-reject updates
//! - `RouteUpdater`: transactional editor over the route tables

pub mod interface;
pub mod neighbor;
pub mod route;
pub mod vlan;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::debug;

pub use interface::{format_mac, parse_mac, Interface, InterfaceMap, DEFAULT_MTU};
pub use neighbor::{ArpTable, NdpTable, NeighborEntry, NeighborTable};
pub use route::{RouteAction, RouteTable, RouteTables, RouteUpdater};
pub use vlan::{Vlan, VlanMap};

/// Scalar naming a virtual routing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RouterId(pub u32);

/// Scalar keying a routed interface within the switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub u32);

/// Scalar keying a VLAN within the switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VlanId(pub u16);

/// Scalar keying a physical port within a VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u16);

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally administered MAC used for interface records until the kernel
/// reports the real tap address.
pub const LOCAL_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// A point-in-time snapshot of the switch's forwarding state.
///
/// Snapshots are cheap to clone: the maps hold `Arc`ed nodes and the route
/// tables sit behind a shared pointer. Mutations clone only the path from
/// the root to the changed node.
#[derive(Debug, Clone)]
pub struct SwitchState {
    interfaces: InterfaceMap,
    vlans: VlanMap,
    route_tables: Arc<RouteTables>,
    local_mac: [u8; 6],
}

impl Default for SwitchState {
    fn default() -> Self {
        Self::new(LOCAL_MAC)
    }
}

impl SwitchState {
    pub fn new(local_mac: [u8; 6]) -> Self {
        Self {
            interfaces: InterfaceMap::default(),
            vlans: VlanMap::default(),
            route_tables: Arc::new(RouteTables::default()),
            local_mac,
        }
    }

    pub fn interfaces(&self) -> &InterfaceMap {
        &self.interfaces
    }

    pub fn vlans(&self) -> &VlanMap {
        &self.vlans
    }

    pub fn route_tables(&self) -> &RouteTables {
        &self.route_tables
    }

    /// MAC of the switch CPU port, used as a placeholder interface address.
    pub fn local_mac(&self) -> [u8; 6] {
        self.local_mac
    }

    pub fn reset_interfaces(&mut self, interfaces: InterfaceMap) {
        self.interfaces = interfaces;
    }

    pub fn reset_vlans(&mut self, vlans: VlanMap) {
        self.vlans = vlans;
    }

    pub fn reset_route_tables(&mut self, route_tables: RouteTables) {
        self.route_tables = Arc::new(route_tables);
    }
}

/// Shared, transactional access to the authoritative switch state.
///
/// Reads are wait-free; updates take a commit lock so concurrent mutation
/// functions are linearized in commit order.
pub struct SwitchHandle {
    state: ArcSwap<SwitchState>,
    commit_lock: Mutex<()>,
    commits: AtomicU64,
    rejections: AtomicU64,
}

impl SwitchHandle {
    pub fn new(seed: SwitchState) -> Self {
        Self {
            state: ArcSwap::from_pointee(seed),
            commit_lock: Mutex::new(()),
            commits: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Wait-free.
    pub fn current_state(&self) -> Arc<SwitchState> {
        self.state.load_full()
    }

    /// Apply `update` to the current snapshot and commit the result.
    ///
    /// The update function returning `None` means "commit nothing"; this is
    /// the normal outcome for events that turn out to be no-ops. Returns
    /// whether a commit happened.
    pub fn update_state_blocking<F>(&self, label: &str, update: F) -> bool
    where
        F: FnOnce(&SwitchState) -> Option<SwitchState>,
    {
        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.state.load_full();
        match update(&current) {
            Some(next) => {
                self.state.store(Arc::new(next));
                self.commits.fetch_add(1, Ordering::Relaxed);
                debug!(label, "state update committed");
                true
            }
            None => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(label, "state update was a no-op");
                false
            }
        }
    }

    /// Number of committed updates.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of updates whose mutation function returned no change.
    pub fn rejection_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
