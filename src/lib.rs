//! swbridge: a control-plane bridge between the Linux kernel and a software
//! switch.
//!
//! The bridge fronts each switch VLAN with a kernel tap device, mirrors the
//! kernel's link/route/neighbor/address tables through a routing-netlink
//! subscription, and reconciles kernel changes into transactional updates
//! of the switch's copy-on-write forwarding snapshot. A second worker pumps
//! frames the host writes into the taps back into the switch fabric.
//!
//! Architecture:
//! - `tap` / `registry`: tap endpoints and the dual index over them
//! - `netlink`: subscription socket, kernel-table caches, decoded events
//! - `dispatch`: the four reconciliation handlers
//! - `listener`: bootstrap, worker lifecycle, and the poll loop
//! - `pump`: epoll fan-in from the taps into the switch's packet API
//! - `state` / `packet` / `stats`: contracts of the switch collaborators

pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod netlink;
pub mod packet;
pub mod pump;
pub mod registry;
pub mod state;
pub mod stats;
pub mod tap;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use listener::NetlinkListener;
