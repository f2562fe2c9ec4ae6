use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swbridge::packet::{PacketIo, TxPacket};
use swbridge::state::{InterfaceId, PortId, SwitchHandle, SwitchState, Vlan, VlanId, VlanMap};
use swbridge::stats::BridgeStats;
use swbridge::{BridgeConfig, NetlinkListener};

#[derive(Parser)]
#[command(name = "swbridge")]
#[command(about = "Bridges kernel networking state into a software switch")]
struct Args {
    /// Prefix for tap device names (the VLAN id is appended)
    #[arg(long, default_value = "tap")]
    tap_prefix: String,

    /// Netlink poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// VLAN ids to front with tap devices (repeatable)
    #[arg(long = "vlan", required = true)]
    vlans: Vec<u16>,
}

/// Packet sink that logs frames instead of delivering them to hardware.
/// Stands in for the forwarding agent when bringing the bridge up alone.
struct LogFabric;

impl PacketIo for LogFabric {
    fn allocate_l2_tx_packet(&self, capacity: usize) -> TxPacket {
        TxPacket::with_capacity(capacity)
    }

    fn send_l2_packet(&self, interface: InterfaceId, packet: TxPacket) {
        info!(interface = %interface, len = packet.len(), "frame handed to fabric");
    }
}

fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swbridge=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    info!("initializing swbridge");

    // Seed one VLAN (with one port) per requested id; the listener derives
    // interfaces and tap devices from these.
    let mut vlans = VlanMap::default();
    for (slot, vlan_id) in args.vlans.iter().enumerate() {
        let mut vlan = Vlan::new(VlanId(*vlan_id), format!("vlan{vlan_id}"));
        vlan.add_port(PortId((slot + 1) as u16));
        vlans.insert(vlan);
    }
    let mut seed = SwitchState::default();
    seed.reset_vlans(vlans);

    let switch = Arc::new(SwitchHandle::new(seed));
    let stats = Arc::new(BridgeStats::new());
    let config = BridgeConfig {
        tap_prefix: args.tap_prefix,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
    };

    let mut listener = NetlinkListener::new(config, switch, Arc::new(LogFabric), stats)?;
    listener.add_interfaces_and_update_state()?;
    listener.start()?;
    info!("bridge running");

    loop {
        std::thread::park();
    }
}
