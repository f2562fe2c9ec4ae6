//! Error types for bridge operations.

use thiserror::Error;

/// Errors that can occur while bridging kernel state into the switch.
#[derive(Debug, Error)]
pub enum Error {
    /// Tap device or netlink socket syscall failure.
    #[error("kernel I/O error: {0}")]
    KernelIo(#[from] std::io::Error),

    /// Protocol-level netlink failure (bind, dump, rejected request).
    #[error("netlink error: {0}")]
    Netlink(String),

    /// A netlink message could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] netlink_packet_utils::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
