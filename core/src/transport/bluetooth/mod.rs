//! Bluetooth transport
//!
//! This module provides the protocol-level side of the Bluetooth mesh:
//!
//! - **advertisement**: service UUIDs and the BLE manufacturer-data payload
//! - **discovery**: the scan/advertise cycle over platform scanner and advertiser
//! - **switcher**: the gossip protocol deciding which devices to dial
//!
//! The platform supplies streams (RFCOMM sockets, GATT relays) through
//! [`BtStreamProvider`] and reports radio events through
//! [`BtTransportHandle`]. Bluetooth links carry no heartbeats; socket errors
//! are their only liveness signal.

pub mod advertisement;
pub mod discovery;
pub mod switcher;

pub use advertisement::{service_uuids, uuids_for_ports, AdvertisementError, ManufacturerData};
pub use discovery::{Advertiser, DiscoveryManager, DiscoverySignal, DiscoveryState, Scanner};
pub use switcher::{Switcher, SwitcherAction};

use super::abstraction::{LinkKind, TransportCommand, TransportError, TransportEvent, TransportHandle, TransportKind};
use super::link::{
    ready_stream, spawn_link, BoxedStream, LinkConfig, LinkControl, LinkEvent, LinkEventKind,
    LinkHandle, LinkId,
};
use crate::config::Config;
use crate::frame::{BtAddress, Frame, HelloFrame, Peer};
use crate::identity::NodeId;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opens outgoing Bluetooth streams
#[async_trait]
pub trait BtStreamProvider: Send + Sync {
    /// Connect to the service `service` on the device at `address`
    async fn connect(&self, address: BtAddress, service: Uuid) -> io::Result<BoxedStream>;
}

/// Platform collaborators of the Bluetooth transport
pub struct BluetoothPlatform {
    pub streams: Arc<dyn BtStreamProvider>,
    pub scanner: Box<dyn Scanner>,
    pub advertiser: Box<dyn Advertiser>,
}

enum BtCommand {
    AdapterEnabled { address: BtAddress },
    AdapterDisabled,
    AddressDiscovered { address: BtAddress, ports: Vec<u32> },
    AdvertisementReceived { data: Vec<u8> },
    StreamAccepted { address: BtAddress, kind: LinkKind, stream: BoxedStream },
    PortsChanged(Vec<u32>),
    ScanStopped { error: bool },
    AdvertiseStopped { error: bool },
    Neighbors(oneshot::Sender<Vec<BtAddress>>),
}

/// Handle to a running Bluetooth transport; platform callbacks go through it
#[derive(Clone)]
pub struct BtTransportHandle {
    commands: mpsc::UnboundedSender<BtCommand>,
    transport: TransportHandle,
}

impl BtTransportHandle {
    /// Lifecycle handle used by the aggregate transport
    pub fn transport_handle(&self) -> TransportHandle {
        self.transport.clone()
    }

    /// Adapter is on and the local address is known
    pub fn adapter_enabled(&self, address: BtAddress) -> Result<(), TransportError> {
        self.post(BtCommand::AdapterEnabled { address })
    }

    pub fn adapter_disabled(&self) -> Result<(), TransportError> {
        self.post(BtCommand::AdapterDisabled)
    }

    /// A device offering `ports` was found
    pub fn address_discovered(&self, address: BtAddress, ports: Vec<u32>) -> Result<(), TransportError> {
        self.post(BtCommand::AddressDiscovered { address, ports })
    }

    /// Raw manufacturer data from a BLE scan result
    pub fn advertisement_received(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.post(BtCommand::AdvertisementReceived { data })
    }

    /// A remote device opened a stream to us
    pub fn stream_accepted(
        &self,
        address: BtAddress,
        kind: LinkKind,
        stream: BoxedStream,
    ) -> Result<(), TransportError> {
        self.post(BtCommand::StreamAccepted {
            address,
            kind,
            stream,
        })
    }

    /// Free listening slots changed
    pub fn ports_changed(&self, ports: Vec<u32>) -> Result<(), TransportError> {
        self.post(BtCommand::PortsChanged(ports))
    }

    pub fn scan_stopped(&self, error: bool) -> Result<(), TransportError> {
        self.post(BtCommand::ScanStopped { error })
    }

    pub fn advertise_stopped(&self, error: bool) -> Result<(), TransportError> {
        self.post(BtCommand::AdvertiseStopped { error })
    }

    /// Addresses of the current direct switcher neighbors
    pub async fn neighbors(&self) -> Result<Vec<BtAddress>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(BtCommand::Neighbors(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| TransportError::NotRunning("Bluetooth".to_string()))
    }

    fn post(&self, command: BtCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::NotRunning("Bluetooth".to_string()))
    }
}

struct BtLink {
    control: LinkControl,
    address: BtAddress,
    client: bool,
    handle: Option<LinkHandle>,
    /// This link registered its address with the switcher
    in_switcher: bool,
}

/// Bluetooth transport actor; all state lives on its task
pub struct BtTransport {
    app_id: u32,
    node_id: NodeId,
    config: Arc<Config>,
    streams: Arc<dyn BtStreamProvider>,
    uuids: Vec<Uuid>,
    discovery: DiscoveryManager,
    switcher: Switcher,
    events: mpsc::UnboundedSender<TransportEvent>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    running: bool,
    adapter_ready: bool,
    address: BtAddress,
    links: HashMap<LinkId, BtLink>,
    /// Devices that failed to connect, ignored until the instant passes
    unsuitable: HashMap<BtAddress, Instant>,
}

impl BtTransport {
    /// Spawn the transport task; it starts stopped with the adapter off
    pub fn spawn(
        app_id: u32,
        node_id: NodeId,
        config: Arc<Config>,
        platform: BluetoothPlatform,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> BtTransportHandle {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let discovery = DiscoveryManager::new(
            config.bluetooth.clone(),
            platform.scanner,
            platform.advertiser,
            ManufacturerData::new(app_id, BtAddress::UNSET, Vec::new()),
            signals_tx,
        );

        let transport = BtTransport {
            app_id,
            node_id,
            switcher: Switcher::new(config.bluetooth.connections_count_max),
            config,
            streams: platform.streams,
            uuids: service_uuids(app_id),
            discovery,
            events,
            link_events_tx,
            running: false,
            adapter_ready: false,
            address: BtAddress::UNSET,
            links: HashMap::new(),
            unsuitable: HashMap::new(),
        };
        tokio::spawn(transport.run(lifecycle_rx, commands_rx, link_events_rx, signals_rx));

        BtTransportHandle {
            commands: commands_tx,
            transport: TransportHandle::new(TransportKind::Bluetooth, lifecycle_tx),
        }
    }

    async fn run(
        mut self,
        mut lifecycle: mpsc::UnboundedReceiver<TransportCommand>,
        mut commands: mpsc::UnboundedReceiver<BtCommand>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut signals: mpsc::UnboundedReceiver<DiscoverySignal>,
    ) {
        loop {
            tokio::select! {
                command = lifecycle.recv() => match command {
                    Some(command) => self.handle_lifecycle(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = link_events.recv() => self.handle_link_event(event),
                Some(signal) = signals.recv() => self.discovery.on_signal(signal),
            }
        }
        debug!("Bluetooth transport task finished");
    }

    fn handle_lifecycle(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Start => self.start(),
            TransportCommand::Stop => self.stop(),
            TransportCommand::Foreground => self.discovery.set_foreground(true),
            TransportCommand::Background => self.discovery.set_foreground(false),
        }
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!("Bluetooth transport started");
        if self.adapter_ready {
            self.activate();
        } else {
            debug!("Bluetooth adapter not ready, waiting");
        }
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.discovery.stop();
        for link in self.links.values() {
            link.control.disconnect();
        }
        info!("Bluetooth transport stopped");
    }

    /// Begin discovery once both the transport and the adapter are up
    fn activate(&mut self) {
        let legacy = !self.discovery.is_peripheral_supported();
        if legacy {
            debug!("BLE peripheral mode not supported, running as legacy device");
        }
        self.switcher.set_address(self.address);
        self.switcher.set_legacy(legacy);
        self.refresh_advertisement();
        self.discovery.start();
    }

    fn refresh_advertisement(&mut self) {
        let data = ManufacturerData::new(self.app_id, self.address, self.switcher.me().ports.clone());
        self.discovery.set_advertisement(data);
    }

    fn handle_command(&mut self, command: BtCommand) {
        match command {
            BtCommand::AdapterEnabled { address } => {
                info!("Bluetooth adapter enabled, address {}", address);
                self.address = address;
                self.adapter_ready = true;
                if self.running {
                    self.activate();
                }
            }
            BtCommand::AdapterDisabled => {
                info!("Bluetooth adapter disabled");
                self.adapter_ready = false;
                self.address = BtAddress::UNSET;
                self.switcher.set_address(BtAddress::UNSET);
                self.discovery.stop();
                for link in self.links.values() {
                    link.control.disconnect();
                }
            }
            BtCommand::AddressDiscovered { address, ports } => self.on_address_discovered(address, ports),
            BtCommand::AdvertisementReceived { data } => match ManufacturerData::parse(&data) {
                Ok(adv) if adv.app_id == self.app_id => self.on_address_discovered(adv.address, adv.ports),
                Ok(adv) => debug!("Ignoring advertisement for app {}", adv.app_id),
                Err(e) => debug!("Ignoring advertisement: {}", e),
            },
            BtCommand::StreamAccepted {
                address,
                kind,
                stream,
            } => {
                if !self.running || !self.adapter_ready {
                    debug!("Dropping stream from {} while stopped", address);
                    return;
                }
                debug!("Accepted {} stream from {}", kind, address);
                self.add_link(kind, address, false, ready_stream(stream));
            }
            BtCommand::PortsChanged(ports) => {
                let actions = self.switcher.on_ports_changed(ports);
                self.refresh_advertisement();
                self.apply(actions);
            }
            BtCommand::ScanStopped { error } => self.discovery.on_scan_stopped(error),
            BtCommand::AdvertiseStopped { error } => self.discovery.on_advertise_stopped(error),
            BtCommand::Neighbors(reply) => {
                let _ = reply.send(self.switcher.neighbors());
            }
        }
    }

    fn on_address_discovered(&mut self, address: BtAddress, ports: Vec<u32>) {
        if !self.running || !self.adapter_ready || address == self.address {
            return;
        }
        if self.has_link_to(&address) || self.is_unsuitable(&address) {
            return;
        }
        let actions = self.switcher.on_address_discovered(address, ports);
        self.apply(actions);
    }

    fn has_link_to(&self, address: &BtAddress) -> bool {
        self.links.values().any(|link| link.address == *address)
    }

    fn is_unsuitable(&mut self, address: &BtAddress) -> bool {
        let now = Instant::now();
        self.unsuitable.retain(|_, until| *until > now);
        self.unsuitable.contains_key(address)
    }

    fn apply(&mut self, actions: Vec<SwitcherAction>) {
        if !self.running {
            return;
        }
        for action in actions {
            match action {
                SwitcherAction::Connect { address, ports } => self.connect_address(address, ports),
                SwitcherAction::SendFrame { to, frame } => self.send_to(to, frame),
            }
        }
    }

    fn send_to(&self, to: BtAddress, frame: Frame) {
        // The registered link first, any other connected link to `to` after
        let mut candidates: Vec<&BtLink> = self
            .links
            .values()
            .filter(|link| link.address == to && link.handle.is_some())
            .collect();
        candidates.sort_by_key(|link| !link.in_switcher);
        let target = candidates.first().and_then(|link| link.handle.as_ref());
        match target {
            Some(handle) => {
                debug!("Sending {} to {}", frame.kind(), to);
                if let Err(e) = handle.send_link_frame(frame) {
                    warn!("Could not send to {}: {}", to, e);
                }
            }
            None => debug!("No connected link to {} for {}", to, frame.kind()),
        }
    }

    fn connect_address(&mut self, address: BtAddress, ports: Vec<u32>) {
        if !self.adapter_ready || self.has_link_to(&address) || self.is_unsuitable(&address) {
            return;
        }
        let mut uuids = uuids_for_ports(&self.uuids, &ports);
        if uuids.is_empty() {
            debug!("No usable ports for {}", address);
            return;
        }
        uuids.shuffle(&mut rand::thread_rng());

        debug!("Dialing {} on {} services", address, uuids.len());
        let streams = self.streams.clone();
        let connect = async move {
            let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no services to try");
            for uuid in uuids {
                match streams.connect(address, uuid).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_error = e,
                }
            }
            Err(last_error)
        };
        self.add_link(LinkKind::Bluetooth, address, true, connect);
    }

    fn add_link<F>(&mut self, kind: LinkKind, address: BtAddress, client: bool, connect: F)
    where
        F: std::future::Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        let hello = HelloFrame {
            node_id: self.node_id,
            peer: Some(self.switcher.me().clone()),
        };
        let control = spawn_link(
            kind,
            connect,
            hello,
            LinkConfig::without_keepalive(&self.config),
            self.link_events_tx.clone(),
        );
        self.links.insert(
            control.id(),
            BtLink {
                control,
                address,
                client,
                handle: None,
                in_switcher: false,
            },
        );
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event.kind {
            LinkEventKind::Connected(hello) => self.on_link_connected(event.link, hello),
            LinkEventKind::Frame(data) => {
                if !self.running {
                    return;
                }
                if let Some(handle) = self.links.get(&event.link).and_then(|l| l.handle.clone()) {
                    let _ = self.events.send(TransportEvent::FrameReceived { link: handle, data });
                }
            }
            LinkEventKind::Control(frame) => self.on_control_frame(event.link, frame),
            LinkEventKind::Disconnected { was_connected } => self.on_link_disconnected(event.link, was_connected),
        }
    }

    fn on_link_connected(&mut self, id: LinkId, hello: HelloFrame) {
        let running = self.running;
        let own_id = self.node_id;
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !running {
            link.control.disconnect();
            return;
        }
        if hello.node_id == own_id {
            debug!("{} leads back to this node, closing", id);
            link.control.disconnect();
            return;
        }

        let handle = link.control.handle(hello.node_id);
        link.handle = Some(handle.clone());
        let address = link.address;
        let peer = hello
            .peer
            .unwrap_or_else(|| Peer::new(address, false, Vec::new()))
            .with_address(address);
        debug!("Bluetooth link connected: {} at {}", handle, address);

        if !self.switcher.is_neighbor(&address) {
            if let Some(link) = self.links.get_mut(&id) {
                link.in_switcher = true;
            }
            let actions = self.switcher.on_link_connected(peer);
            self.apply(actions);
        }

        let _ = self.events.send(TransportEvent::LinkConnected(handle));
    }

    fn on_control_frame(&mut self, id: LinkId, frame: Frame) {
        let Some(link) = self.links.get(&id) else {
            return;
        };
        let from = link.address;
        if link.handle.is_none() || !self.switcher.is_neighbor(&from) {
            debug!("{} is not connected to a neighbor, ignoring {}", id, frame.kind());
            return;
        }
        let actions = match frame {
            Frame::Ports(ports) => self.switcher.on_ports_frame(from, ports),
            Frame::Connected(connected) => self.switcher.on_connected_frame(from, connected),
            Frame::Disconnected(disconnected) => self.switcher.on_disconnected_frame(from, disconnected),
            other => {
                debug!("Unexpected {} control frame from {}", other.kind(), from);
                Vec::new()
            }
        };
        self.apply(actions);
    }

    fn on_link_disconnected(&mut self, id: LinkId, was_connected: bool) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };

        if !was_connected && link.client && self.adapter_ready {
            let until = Instant::now() + self.config.bluetooth.ble_unsuitable_cooldown();
            debug!("{} unsuitable until cooldown passes", link.address);
            self.unsuitable.insert(link.address, until);
        }

        if link.in_switcher {
            let survivor = self
                .links
                .values_mut()
                .find(|other| other.address == link.address && other.handle.is_some());
            match survivor {
                Some(other) => {
                    debug!("{} stays a neighbor through {}", link.address, other.control.id());
                    other.in_switcher = true;
                }
                None => {
                    let actions = self.switcher.on_link_disconnected(link.address);
                    self.apply(actions);
                }
            }
        }

        if let (true, Some(handle)) = (was_connected, link.handle) {
            debug!("Bluetooth link disconnected: {}", handle);
            let _ = self.events.send(TransportEvent::LinkDisconnected(handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct IdleScanner;

    impl Scanner for IdleScanner {
        fn start_scan(&mut self, _duration: Duration) {}
        fn stop_scan(&mut self) {}
    }

    struct NoAdvertiser;

    impl Advertiser for NoAdvertiser {
        fn is_supported(&self) -> bool {
            false
        }
        fn start_advertise(&mut self, _duration: Duration, _data: ManufacturerData) {}
        fn stop_advertise(&mut self) {}
        fn touch(&mut self, _data: ManufacturerData) {}
    }

    struct RefusingStreams;

    #[async_trait]
    impl BtStreamProvider for RefusingStreams {
        async fn connect(&self, _address: BtAddress, _service: Uuid) -> io::Result<BoxedStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// Refuses every dial but reports the address it was asked for
    struct RecordingStreams {
        dials: mpsc::UnboundedSender<BtAddress>,
    }

    #[async_trait]
    impl BtStreamProvider for RecordingStreams {
        async fn connect(&self, address: BtAddress, _service: Uuid) -> io::Result<BoxedStream> {
            let _ = self.dials.send(address);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn platform() -> BluetoothPlatform {
        BluetoothPlatform {
            streams: Arc::new(RefusingStreams),
            scanner: Box::new(IdleScanner),
            advertiser: Box::new(NoAdvertiser),
        }
    }

    async fn write_frame(remote: &mut tokio::io::DuplexStream, frame: &Frame) {
        let bytes = crate::frame::encode_frame(frame, 1024).unwrap();
        tokio::io::AsyncWriteExt::write_all(remote, &bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_accepted_stream_registers_neighbor() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = BtTransport::spawn(
            9,
            NodeId::new(1).unwrap(),
            Arc::new(Config::default()),
            platform(),
            events_tx,
        );
        handle.adapter_enabled(BtAddress::new([1; 6])).unwrap();
        handle.transport_handle().send(TransportCommand::Start).unwrap();

        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let remote_address = BtAddress::new([2; 6]);
        handle
            .stream_accepted(remote_address, LinkKind::BluetoothLe, Box::new(local))
            .unwrap();

        let hello = Frame::Hello(HelloFrame {
            node_id: NodeId::new(2).unwrap(),
            peer: Some(Peer::new(BtAddress::UNSET, true, vec![1])),
        });
        let bytes = crate::frame::encode_frame(&hello, 1024).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut remote, &bytes).await.unwrap();

        match events_rx.recv().await {
            Some(TransportEvent::LinkConnected(link)) => {
                assert_eq!(link.node_id(), NodeId::new(2).unwrap());
                assert_eq!(link.priority(), 30);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.neighbors().await.unwrap(), vec![remote_address]);

        drop(remote);
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::LinkDisconnected(_))));
        assert!(handle.neighbors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_link_to_same_address_carries_gossip() {
        let (dials_tx, mut dials) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = BtTransport::spawn(
            9,
            NodeId::new(1).unwrap(),
            Arc::new(Config::default()),
            BluetoothPlatform {
                streams: Arc::new(RecordingStreams { dials: dials_tx }),
                scanner: Box::new(IdleScanner),
                advertiser: Box::new(NoAdvertiser),
            },
            events_tx,
        );
        handle.adapter_enabled(BtAddress::new([1; 6])).unwrap();
        handle.transport_handle().send(TransportCommand::Start).unwrap();

        let remote_address = BtAddress::new([2; 6]);
        let hello = Frame::Hello(HelloFrame {
            node_id: NodeId::new(2).unwrap(),
            peer: Some(Peer::new(BtAddress::UNSET, false, vec![0])),
        });
        let mut remotes = Vec::new();
        for _ in 0..2 {
            let (local, mut remote) = tokio::io::duplex(64 * 1024);
            handle
                .stream_accepted(remote_address, LinkKind::Bluetooth, Box::new(local))
                .unwrap();
            write_frame(&mut remote, &hello).await;
            assert!(matches!(events_rx.recv().await, Some(TransportEvent::LinkConnected(_))));
            remotes.push(remote);
        }
        let mut second = remotes.pop().unwrap();
        let first = remotes.pop().unwrap();

        // Gossip over the link that did not register the neighbor still counts
        let third = BtAddress::new([3; 6]);
        let connected = Frame::Connected(crate::frame::ConnectedFrame {
            peer: Peer::new(third, false, vec![0]),
        });
        write_frame(&mut second, &connected).await;
        let dialed = tokio::time::timeout(Duration::from_secs(2), dials.recv()).await;
        assert_eq!(dialed.unwrap(), Some(third));

        // Losing one of two links keeps the neighbor
        drop(first);
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::LinkDisconnected(_))));
        assert_eq!(handle.neighbors().await.unwrap(), vec![remote_address]);

        drop(second);
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::LinkDisconnected(_))));
        assert!(handle.neighbors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_advertisements_are_ignored() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = BtTransport::spawn(
            9,
            NodeId::new(1).unwrap(),
            Arc::new(Config::default()),
            platform(),
            events_tx,
        );
        handle.adapter_enabled(BtAddress::new([1; 6])).unwrap();
        handle.transport_handle().send(TransportCommand::Start).unwrap();

        let foreign = ManufacturerData::new(10, BtAddress::new([3; 6]), vec![0]).build();
        handle.advertisement_received(foreign).unwrap();
        handle.advertisement_received(vec![1, 2]).unwrap();

        assert!(handle.neighbors().await.unwrap().is_empty());
        let waited = tokio::time::timeout(Duration::from_millis(100), events_rx.recv()).await;
        assert!(waited.is_err());
    }
}
