//! Route accounting counters exposed to the control plane.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for routes learned from and withdrawn by the kernel.
///
/// Shared across workers; all updates are relaxed since the counters are
/// only read for reporting.
#[derive(Debug, Default)]
pub struct BridgeStats {
    route_v4_adds: AtomicU64,
    route_v6_adds: AtomicU64,
    route_v4_dels: AtomicU64,
    route_v6_dels: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route_v4(&self) {
        self.route_v4_adds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_route_v6(&self) {
        self.route_v6_adds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn del_route_v4(&self) {
        self.route_v4_dels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn del_route_v6(&self) {
        self.route_v6_dels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_v4_adds(&self) -> u64 {
        self.route_v4_adds.load(Ordering::Relaxed)
    }

    pub fn route_v6_adds(&self) -> u64 {
        self.route_v6_adds.load(Ordering::Relaxed)
    }

    pub fn route_v4_dels(&self) -> u64 {
        self.route_v4_dels.load(Ordering::Relaxed)
    }

    pub fn route_v6_dels(&self) -> u64 {
        self.route_v6_dels.load(Ordering::Relaxed)
    }
}
