//! Packet hand-off contracts between the bridge and the forwarding agent.

use crate::state::{InterfaceId, VlanId};

/// An L2 frame being assembled for transmission into the switch fabric.
///
/// Allocated through [`PacketIo::allocate_l2_tx_packet`] with a fixed
/// capacity; frame bytes are appended up to the remaining tailroom.
#[derive(Debug)]
pub struct TxPacket {
    buf: Vec<u8>,
    capacity: usize,
}

impl TxPacket {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still available for appending.
    pub fn tailroom(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append frame bytes, truncated to the available tailroom. Returns the
    /// number of bytes actually copied.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.tailroom());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// An L2 frame received from the switch fabric, headed for the host stack.
#[derive(Debug, Clone)]
pub struct RxPacket {
    src_vlan: VlanId,
    data: Vec<u8>,
}

impl RxPacket {
    pub fn new(src_vlan: VlanId, data: Vec<u8>) -> Self {
        Self { src_vlan, data }
    }

    /// VLAN the frame was received on; selects the egress tap endpoint.
    pub fn src_vlan(&self) -> VlanId {
        self.src_vlan
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Packet I/O surface of the forwarding agent.
///
/// The pump allocates one packet per received frame and transfers ownership
/// through [`PacketIo::send_l2_packet`].
pub trait PacketIo: Send + Sync {
    fn allocate_l2_tx_packet(&self, capacity: usize) -> TxPacket;

    fn send_l2_packet(&self, interface: InterfaceId, packet: TxPacket);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_packet_tailroom() {
        let mut packet = TxPacket::with_capacity(100);
        assert_eq!(packet.tailroom(), 100);
        assert_eq!(packet.append(&[0u8; 40]), 40);
        assert_eq!(packet.tailroom(), 60);
        assert_eq!(packet.len(), 40);
    }

    #[test]
    fn test_tx_packet_append_truncates() {
        let mut packet = TxPacket::with_capacity(10);
        assert_eq!(packet.append(&[0u8; 32]), 10);
        assert_eq!(packet.tailroom(), 0);
    }
}
