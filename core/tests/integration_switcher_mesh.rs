//! Bluetooth switcher mesh integration tests
//!
//! Several Bluetooth transports wired together through an in-memory stream
//! provider. Verifies gossip convergence, the fan-out cap and self-healing
//! after a bridge node disappears.
//!
//! Run with: cargo test --test integration_switcher_mesh

use async_trait::async_trait;
use meshlink_core::transport::bluetooth::{
    Advertiser, BluetoothPlatform, BtStreamProvider, BtTransport, BtTransportHandle,
    ManufacturerData, Scanner,
};
use meshlink_core::transport::{BoxedStream, LinkKind, TransportCommand, TransportEvent};
use meshlink_core::{BtAddress, Config, NodeId};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const APP_ID: u32 = 0x00C0FFEE;
const WAIT: Duration = Duration::from_secs(10);

/// Radio environment shared by every node of a test
#[derive(Clone, Default)]
struct Air {
    nodes: Arc<Mutex<HashMap<BtAddress, BtTransportHandle>>>,
    /// Address pairs that cannot reach each other, in either direction
    blocked: Arc<Mutex<HashSet<(BtAddress, BtAddress)>>>,
}

impl Air {
    fn block(&self, a: BtAddress, b: BtAddress) {
        let mut blocked = self.blocked.lock().unwrap();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    fn unblock_all(&self) {
        self.blocked.lock().unwrap().clear();
    }
}

struct AirStreams {
    me: BtAddress,
    air: Air,
}

#[async_trait]
impl BtStreamProvider for AirStreams {
    async fn connect(&self, address: BtAddress, _service: Uuid) -> io::Result<BoxedStream> {
        if self.air.blocked.lock().unwrap().contains(&(self.me, address)) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "out of range"));
        }
        let target = self
            .air
            .nodes
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such device"))?;

        let (local, remote) = tokio::io::duplex(64 * 1024);
        target
            .stream_accepted(self.me, LinkKind::Bluetooth, Box::new(remote))
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(Box::new(local))
    }
}

struct QuietScanner;

impl Scanner for QuietScanner {
    fn start_scan(&mut self, _duration: Duration) {}
    fn stop_scan(&mut self) {}
}

struct QuietAdvertiser;

impl Advertiser for QuietAdvertiser {
    fn is_supported(&self) -> bool {
        true
    }
    fn start_advertise(&mut self, _duration: Duration, _data: ManufacturerData) {}
    fn stop_advertise(&mut self) {}
    fn touch(&mut self, _data: ManufacturerData) {}
}

struct Node {
    address: BtAddress,
    handle: BtTransportHandle,
    _events: mpsc::UnboundedReceiver<TransportEvent>,
}

fn address(n: u8) -> BtAddress {
    BtAddress::new([0x0A, 0, 0, 0, 0, n])
}

fn spawn_node(air: &Air, n: u8) -> Node {
    let mut config = Config::default();
    config.bluetooth.connections_count_max = 2;
    config.bluetooth.ble_unsuitable_cooldown_ms = 1;

    let address = address(n);
    let platform = BluetoothPlatform {
        streams: Arc::new(AirStreams {
            me: address,
            air: air.clone(),
        }),
        scanner: Box::new(QuietScanner),
        advertiser: Box::new(QuietAdvertiser),
    };
    let (events_tx, events) = mpsc::unbounded_channel();
    let handle = BtTransport::spawn(
        APP_ID,
        NodeId::new(n as u64).unwrap(),
        Arc::new(config),
        platform,
        events_tx,
    );
    air.nodes.lock().unwrap().insert(address, handle.clone());

    handle.adapter_enabled(address).unwrap();
    handle.ports_changed(vec![0, 1, 2, 3]).unwrap();
    handle.transport_handle().send(TransportCommand::Start).unwrap();

    Node {
        address,
        handle,
        _events: events,
    }
}

async fn wait_for_neighbors(node: &Node, expected: &[&Node]) {
    let mut want: Vec<BtAddress> = expected.iter().map(|n| n.address).collect();
    want.sort();
    let result = tokio::time::timeout(WAIT, async {
        loop {
            let neighbors = node.handle.neighbors().await.unwrap();
            if neighbors == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if result.is_err() {
        let got = node.handle.neighbors().await.unwrap();
        panic!("{} has neighbors {:?}, wanted {:?}", node.address, got, want);
    }
}

#[tokio::test]
async fn test_gossip_closes_triangle() {
    let air = Air::default();
    let a = spawn_node(&air, 1);
    let b = spawn_node(&air, 2);
    let c = spawn_node(&air, 3);

    // A and C each only see B; B tells each about the other.
    a.handle.address_discovered(b.address, vec![0, 1]).unwrap();
    wait_for_neighbors(&a, &[&b]).await;
    c.handle.address_discovered(b.address, vec![0, 1]).unwrap();

    wait_for_neighbors(&a, &[&b, &c]).await;
    wait_for_neighbors(&b, &[&a, &c]).await;
    wait_for_neighbors(&c, &[&a, &b]).await;
    println!("✓ Three nodes converged to a full triangle");
}

#[tokio::test]
async fn test_fan_out_cap_limits_direct_neighbors() {
    let air = Air::default();
    let a = spawn_node(&air, 1);
    let b = spawn_node(&air, 2);
    let c = spawn_node(&air, 3);
    let d = spawn_node(&air, 4);

    a.handle.address_discovered(b.address, vec![0]).unwrap();
    wait_for_neighbors(&a, &[&b]).await;
    a.handle.address_discovered(c.address, vec![0]).unwrap();
    wait_for_neighbors(&a, &[&b, &c]).await;
    wait_for_neighbors(&b, &[&a, &c]).await;

    a.handle.address_discovered(d.address, vec![0]).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_for_neighbors(&a, &[&b, &c]).await;
    wait_for_neighbors(&d, &[]).await;
}

#[tokio::test]
async fn test_lost_bridge_triggers_direct_connect() {
    let air = Air::default();
    let a = spawn_node(&air, 1);
    let b = spawn_node(&air, 2);
    let c = spawn_node(&air, 3);
    air.block(a.address, c.address);

    a.handle.address_discovered(b.address, vec![0]).unwrap();
    wait_for_neighbors(&a, &[&b]).await;
    c.handle.address_discovered(b.address, vec![0]).unwrap();
    wait_for_neighbors(&b, &[&a, &c]).await;

    // A and C tried each other through B and failed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_for_neighbors(&a, &[&b]).await;
    wait_for_neighbors(&c, &[&b]).await;

    air.unblock_all();
    b.handle.adapter_disabled().unwrap();

    wait_for_neighbors(&a, &[&c]).await;
    wait_for_neighbors(&c, &[&a]).await;
    println!("✓ A and C reconnected directly after losing bridge B");
}

#[tokio::test]
async fn test_advertisement_leads_to_link() {
    let air = Air::default();
    let a = spawn_node(&air, 1);
    let b = spawn_node(&air, 2);

    let foreign = ManufacturerData::new(APP_ID + 1, b.address, vec![0]).build();
    a.handle.advertisement_received(foreign).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_for_neighbors(&a, &[]).await;

    let ours = ManufacturerData::new(APP_ID, b.address, vec![0, 2]).build();
    a.handle.advertisement_received(ours).unwrap();
    wait_for_neighbors(&a, &[&b]).await;
    wait_for_neighbors(&b, &[&a]).await;
}
