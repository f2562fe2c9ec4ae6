//! Ingress pump: epoll fan-in over tap endpoints into the switch fabric.
//!
//! One dedicated worker waits for read readiness across every tap fd, reads
//! one frame per ready event (level-triggered, so a busy tap re-signals),
//! and hands each frame to the switch's send API. A cancel eventfd sits in
//! the readiness set so shutdown does not depend on fd closure.

use std::os::fd::BorrowedFd;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::packet::PacketIo;
use crate::registry::EndpointRegistry;
use crate::state::SwitchHandle;
use crate::tap::{ReadOutcome, TapEndpoint};

/// Token marking the cancel eventfd in the readiness set. Kernel interface
/// indexes are small positive integers, so this cannot collide.
const CANCEL_TOKEN: u64 = u64::MAX;

/// Scratch sized for jumbo frames from the host. Frames larger than the
/// destination packet's tailroom are dropped, not truncated.
const MAX_FRAME: usize = 9216;

/// Handle to the running pump worker.
pub struct PumpHandle {
    thread: Option<JoinHandle<()>>,
    cancel: Arc<EventFd>,
}

impl PumpHandle {
    /// Signal the worker to stop.
    pub fn stop(&self) {
        if let Err(e) = self.cancel.write(1) {
            warn!(error = %e, "failed to signal pump cancel event");
        }
    }

    /// Wait for the worker to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("ingress pump thread panicked");
            }
        }
    }
}

/// Spawn the pump worker over all endpoints currently in the registry.
pub fn spawn_pump(
    registry: Arc<EndpointRegistry>,
    switch: Arc<SwitchHandle>,
    packet_io: Arc<dyn PacketIo>,
) -> Result<PumpHandle> {
    let cancel = Arc::new(
        EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(|errno| Error::KernelIo(errno.into()))?,
    );
    let cancel_for_worker = cancel.clone();
    let thread = thread::Builder::new()
        .name("ingress-pump".to_string())
        .spawn(move || pump_loop(&registry, &switch, &*packet_io, &cancel_for_worker))
        .map_err(Error::KernelIo)?;
    Ok(PumpHandle {
        thread: Some(thread),
        cancel,
    })
}

fn pump_loop(
    registry: &EndpointRegistry,
    switch: &SwitchHandle,
    packet_io: &dyn PacketIo,
    cancel: &EventFd,
) {
    let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
        Ok(epoll) => epoll,
        Err(e) => {
            error!(error = %e, "epoll creation failed");
            process::exit(1);
        }
    };
    for endpoint in registry.iter() {
        let Some(fd) = endpoint.raw_fd() else {
            warn!(name = %endpoint.name(), "endpoint closed before pump start, skipping");
            continue;
        };
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(EpollFlags::EPOLLIN, u64::from(endpoint.ifindex()));
        if let Err(e) = epoll.add(fd, event) {
            error!(name = %endpoint.name(), error = %e, "failed to register tap with epoll");
            process::exit(1);
        }
    }
    if let Err(e) = epoll.add(cancel, EpollEvent::new(EpollFlags::EPOLLIN, CANCEL_TOKEN)) {
        error!(error = %e, "failed to register cancel event with epoll");
        process::exit(1);
    }

    info!(endpoints = registry.len(), "ingress pump entering wait loop");
    let mut events = vec![EpollEvent::empty(); registry.len() + 1];
    let mut scratch = vec![0u8; MAX_FRAME];
    'wait: loop {
        let ready = match epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(ready) => ready,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                error!(error = %e, "epoll wait failed");
                process::exit(1);
            }
        };
        for event in &events[..ready] {
            let token = event.data();
            if token == CANCEL_TOKEN {
                info!("ingress pump cancelled");
                break 'wait;
            }
            let Some(endpoint) = registry.by_index(token as u32) else {
                continue;
            };
            if !forward_frame(endpoint, switch, packet_io, &mut scratch) {
                break 'wait;
            }
        }
    }
    info!("ingress pump stopped");
}

/// Read one frame from `endpoint` and hand it to the fabric.
///
/// Returns `false` on a hard read error, which terminates the pump.
fn forward_frame(
    endpoint: &TapEndpoint,
    switch: &SwitchHandle,
    packet_io: &dyn PacketIo,
    scratch: &mut [u8],
) -> bool {
    let state = switch.current_state();
    let Some(interface) = state.interfaces().get(endpoint.interface_id()) else {
        warn!(name = %endpoint.name(), "no interface record for tap, dropping packet from host");
        return true;
    };
    match endpoint.read_frame(scratch) {
        Ok(ReadOutcome::Frame(len)) => {
            let mut packet = packet_io.allocate_l2_tx_packet(interface.mtu() as usize);
            if len > packet.tailroom() {
                warn!(
                    len,
                    tailroom = packet.tailroom(),
                    name = %endpoint.name(),
                    "oversized frame from host, dropping"
                );
                return true;
            }
            packet.append(&scratch[..len]);
            debug!(len, name = %endpoint.name(), "forwarding frame to fabric");
            packet_io.send_l2_packet(interface.id(), packet);
            true
        }
        Ok(ReadOutcome::WouldBlock) => true,
        Ok(ReadOutcome::Eof) => {
            debug!(name = %endpoint.name(), "tap read returned EOF, ignoring");
            true
        }
        Err(e) => {
            warn!(name = %endpoint.name(), error = %e, "tap read failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TxPacket;
    use crate::state::{
        Interface, InterfaceId, InterfaceMap, RouterId, SwitchState, VlanId, DEFAULT_MTU,
        LOCAL_MAC,
    };
    use std::fs::File;
    use std::sync::Mutex;

    struct CollectFabric {
        sent: Mutex<Vec<(InterfaceId, Vec<u8>)>>,
    }

    impl CollectFabric {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl PacketIo for CollectFabric {
        fn allocate_l2_tx_packet(&self, capacity: usize) -> TxPacket {
            TxPacket::with_capacity(capacity)
        }

        fn send_l2_packet(&self, interface: InterfaceId, packet: TxPacket) {
            self.sent
                .lock()
                .unwrap()
                .push((interface, packet.as_bytes().to_vec()));
        }
    }

    fn switch_with_interface(mtu: u32) -> SwitchHandle {
        let mut interfaces = InterfaceMap::default();
        interfaces.insert(Interface::new(
            InterfaceId(1),
            RouterId(0),
            VlanId(1),
            "tap1".to_string(),
            LOCAL_MAC,
            mtu,
        ));
        let mut seed = SwitchState::default();
        seed.reset_interfaces(interfaces);
        SwitchHandle::new(seed)
    }

    fn piped_endpoint() -> (TapEndpoint, std::os::fd::OwnedFd) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let endpoint = TapEndpoint::from_file(
            File::from(read_end),
            "tap1".to_string(),
            42,
            RouterId(0),
            InterfaceId(1),
            VlanId(1),
        );
        (endpoint, write_end)
    }

    #[test]
    fn test_forward_frame_sends_to_fabric() {
        let (endpoint, write_end) = piped_endpoint();
        let switch = switch_with_interface(DEFAULT_MTU);
        let fabric = CollectFabric::new();
        nix::unistd::write(&write_end, &[0x5a; 100]).unwrap();

        let mut scratch = vec![0u8; MAX_FRAME];
        assert!(forward_frame(&endpoint, &switch, &fabric, &mut scratch));
        let sent = fabric.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, InterfaceId(1));
        assert_eq!(sent[0].1, vec![0x5a; 100]);
    }

    #[test]
    fn test_forward_frame_drops_oversized() {
        let (endpoint, write_end) = piped_endpoint();
        let switch = switch_with_interface(1500);
        let fabric = CollectFabric::new();
        // Larger than the interface MTU, smaller than the scratch buffer.
        nix::unistd::write(&write_end, &vec![0u8; 2000]).unwrap();

        let mut scratch = vec![0u8; MAX_FRAME];
        assert!(forward_frame(&endpoint, &switch, &fabric, &mut scratch));
        assert!(fabric.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forward_frame_drops_without_interface_record() {
        let (endpoint, write_end) = piped_endpoint();
        let switch = SwitchHandle::new(SwitchState::default());
        let fabric = CollectFabric::new();
        nix::unistd::write(&write_end, &[0u8; 64]).unwrap();

        let mut scratch = vec![0u8; MAX_FRAME];
        assert!(forward_frame(&endpoint, &switch, &fabric, &mut scratch));
        assert!(fabric.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pump_cancellation() {
        let (endpoint, _write_end) = piped_endpoint();
        let mut registry = EndpointRegistry::new();
        registry.insert(endpoint);
        let registry = Arc::new(registry);
        let switch = Arc::new(switch_with_interface(DEFAULT_MTU));
        let fabric: Arc<dyn PacketIo> = Arc::new(CollectFabric::new());

        let mut handle = spawn_pump(registry, switch, fabric).unwrap();
        handle.stop();
        handle.join();
    }
}
