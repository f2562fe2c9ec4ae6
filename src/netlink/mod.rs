//! Routing-netlink subscription, kernel-table caches, and decoded change
//! events.

pub mod cache;
pub mod event;
pub mod subscription;

pub use cache::{AddressCache, LinkCache, NeighborCache, RouteCache};
pub use event::{
    Action, AddressEvent, Event, EventPayload, Family, LinkEvent, NeighborEvent, NextHop,
    RouteEvent,
};
pub use subscription::{EventHandler, KernelSubscription};
