//! Netlink listener: bootstrap fan-out, worker lifecycle, and the cache
//! poll loop.
//!
//! `NetlinkListener` owns the whole control-plane bridge: it connects the
//! kernel subscription, creates one tap endpoint per seed VLAN, and runs
//! two workers — the listener loop driving the subscription poll (where all
//! reconciliation handlers execute) and the ingress pump. The registry is
//! append-only during bootstrap and immutable while the workers run, so
//! neither worker takes locks to read it.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::dispatch::ChangeDispatcher;
use crate::error::{Error, Result};
use crate::netlink::KernelSubscription;
use crate::packet::{PacketIo, RxPacket};
use crate::pump::{spawn_pump, PumpHandle};
use crate::registry::EndpointRegistry;
use crate::state::{
    Interface, InterfaceId, InterfaceMap, RouterId, SwitchHandle, Vlan, VlanMap, DEFAULT_MTU,
};
use crate::stats::BridgeStats;
use crate::tap::TapEndpoint;

/// Handle to the running listener worker.
struct ListenerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ListenerHandle {
    fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("netlink listener thread panicked");
            }
        }
    }
}

/// The control-plane bridge between the kernel and the switch.
pub struct NetlinkListener {
    config: BridgeConfig,
    switch: Arc<SwitchHandle>,
    packet_io: Arc<dyn PacketIo>,
    stats: Arc<BridgeStats>,
    registry: Arc<EndpointRegistry>,
    subscription: Option<KernelSubscription>,
    listener: Option<ListenerHandle>,
    pump: Option<PumpHandle>,
}

impl NetlinkListener {
    /// Connect the kernel subscription and prepare an empty registry.
    pub fn new(
        config: BridgeConfig,
        switch: Arc<SwitchHandle>,
        packet_io: Arc<dyn PacketIo>,
        stats: Arc<BridgeStats>,
    ) -> Result<Self> {
        let subscription = KernelSubscription::connect()?;
        Ok(Self {
            config,
            switch,
            packet_io,
            stats,
            registry: Arc::new(EndpointRegistry::new()),
            subscription: Some(subscription),
            listener: None,
            pump: None,
        })
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Fan out one tap endpoint per seed VLAN and seed the switch's
    /// interface and VLAN maps to match.
    ///
    /// Interfaces and VLANs reference each other, so both maps are replaced
    /// together: interface ids are derived 1:1 from the VLAN ids, with the
    /// switch CPU MAC and default MTU as placeholders until the kernel
    /// reports the real values. On a listener restart the registry is
    /// already populated and nothing is recreated.
    pub fn add_interfaces_and_update_state(&mut self) -> Result<()> {
        if !self.registry.is_empty() {
            info!("not recreating tap interfaces on listener restart");
            return Ok(());
        }

        let seed = self.switch.current_state();
        let local_mac = seed.local_mac();
        info!(vlans = seed.vlans().len(), "adding interfaces for seed VLANs");

        let mut interfaces = InterfaceMap::default();
        let mut vlans = VlanMap::default();
        for vlan in seed.vlans().iter() {
            let interface_id = InterfaceId(u32::from(vlan.id().0));
            let name = format!("{}{}", self.config.tap_prefix, vlan.id());
            interfaces.insert(Interface::new(
                interface_id,
                RouterId(0),
                vlan.id(),
                name,
                local_mac,
                DEFAULT_MTU,
            ));

            // Rebuild the VLAN with only what the bridge needs: id, name,
            // ports, and the interface reference.
            let mut new_vlan = Vlan::new(vlan.id(), format!("vlan{}", vlan.id()));
            new_vlan.set_interface(interface_id);
            for port in vlan.ports() {
                new_vlan.add_port(*port);
            }
            vlans.insert(new_vlan);
            debug!(vlan = %vlan.id(), "VLAN rebuilt with interface reference");
        }

        self.switch
            .update_state_blocking("Purge existing Interfaces and Vlans", |state| {
                let mut next = state.clone();
                next.reset_interfaces(InterfaceMap::default());
                next.reset_vlans(VlanMap::default());
                Some(next)
            });
        self.switch.update_state_blocking(
            "Add NetlinkListener initial Interfaces and Vlans",
            move |state| {
                let mut next = state.clone();
                next.reset_interfaces(interfaces);
                next.reset_vlans(vlans);
                Some(next)
            },
        );

        // Creating the taps triggers a burst of link/address notifications;
        // the handlers fill in the real MAC, MTU, and addresses from those.
        let mut registry = EndpointRegistry::new();
        for vlan in seed.vlans().iter() {
            let name = format!("{}{}", self.config.tap_prefix, vlan.id());
            let endpoint = TapEndpoint::open(
                &name,
                RouterId(0),
                InterfaceId(u32::from(vlan.id().0)),
                vlan.id(),
            )?;
            registry.insert(endpoint);
        }
        self.registry = Arc::new(registry);
        Ok(())
    }

    /// Spawn the listener and pump workers. Idempotent: calling again after
    /// a successful start only logs.
    pub fn start(&mut self) -> Result<()> {
        let Some(mut subscription) = self.subscription.take() else {
            warn!("netlink listener already started");
            return Ok(());
        };

        // Attach the reconciliation handlers, in the cache wiring order.
        let dispatcher = Arc::new(ChangeDispatcher::new(
            self.registry.clone(),
            self.switch.clone(),
            self.stats.clone(),
        ));
        let route_dispatcher = dispatcher.clone();
        subscription.on_route(Box::new(move |event| route_dispatcher.dispatch(event)));
        let link_dispatcher = dispatcher.clone();
        subscription.on_link(Box::new(move |event| link_dispatcher.dispatch(event)));
        let neighbor_dispatcher = dispatcher.clone();
        subscription.on_neighbor(Box::new(move |event| neighbor_dispatcher.dispatch(event)));
        subscription.on_address(Box::new(move |event| dispatcher.dispatch(event)));

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = shutdown.clone();
        let poll_interval = self.config.poll_interval;
        let thread = thread::Builder::new()
            .name("netlink-listener".to_string())
            .spawn(move || listener_loop(subscription, poll_interval, &worker_shutdown))
            .map_err(Error::KernelIo)?;
        self.listener = Some(ListenerHandle {
            thread: Some(thread),
            shutdown,
        });
        info!("started netlink listener worker");

        self.pump = Some(spawn_pump(
            self.registry.clone(),
            self.switch.clone(),
            self.packet_io.clone(),
        )?);
        info!("started ingress pump worker");
        Ok(())
    }

    /// Stop both workers, release the tap endpoints, and tear down the
    /// subscription.
    pub fn stop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        if let Some(pump) = &self.pump {
            pump.stop();
        }
        if let Some(mut listener) = self.listener.take() {
            listener.join();
            info!("stopped netlink listener worker");
        }
        if let Some(mut pump) = self.pump.take() {
            pump.join();
            info!("stopped ingress pump worker");
        }

        // The workers are gone, so the registry should be exclusively ours
        // again; fall back to closing in place if something still holds it.
        match Arc::get_mut(&mut self.registry) {
            Some(registry) => registry.clear(),
            None => {
                warn!("endpoint registry still shared at shutdown, closing endpoints in place");
                self.registry.close_all();
            }
        }
        // A subscription that never started drops here; a started one was
        // consumed by the listener worker.
        self.subscription = None;
    }

    /// Inverse data path: deliver a switch-received frame to the host stack
    /// through the tap fronting the packet's source VLAN.
    pub fn send_packet_to_host(&self, packet: RxPacket) -> bool {
        let Some(endpoint) = self.registry.by_vlan(packet.src_vlan()) else {
            debug!(vlan = %packet.src_vlan(), "dropping packet for unknown tap interface");
            return false;
        };
        match endpoint.write_frame(packet.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                warn!(name = %endpoint.name(), error = %e, "failed to write frame to host");
                false
            }
        }
    }
}

impl Drop for NetlinkListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The listener worker: drives the subscription poll until cancelled.
///
/// This is the only thread that runs the reconciliation handlers, so they
/// observe registry mutations only from the already-completed bootstrap. A
/// poll failure is fatal: the subscription is torn down and the process
/// aborts with the underlying error code.
fn listener_loop(
    mut subscription: KernelSubscription,
    poll_interval: Duration,
    shutdown: &AtomicBool,
) {
    info!("netlink listener entering poll loop");
    while !shutdown.load(Ordering::SeqCst) {
        match subscription.poll(poll_interval) {
            Ok(0) => trace!("no news from netlink, polling"),
            Ok(updates) => debug!(updates, "processed netlink updates"),
            Err(e) => {
                error!(error = %e, "cache manager poll failed");
                let code = match &e {
                    Error::KernelIo(io) => io.raw_os_error().unwrap_or(1),
                    _ => 1,
                };
                drop(subscription);
                process::exit(code);
            }
        }
    }
    info!("netlink listener poll loop exited");
}
