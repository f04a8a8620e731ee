//! Wi-Fi transport: TCP links to peers found through local service discovery
//!
//! The transport listens on a TCP port, publishes it as a DNS-SD style service
//! named after the local node id, and dials every resolved service instance
//! that is neither itself nor an already linked node. Links use heartbeats and
//! a read timeout because a silent TCP peer is otherwise undetectable.

use super::abstraction::{LinkKind, TransportCommand, TransportError, TransportEvent, TransportHandle, TransportKind};
use super::link::{
    ready_stream, spawn_link, BoxedStream, LinkConfig, LinkControl, LinkEvent, LinkEventKind,
    LinkHandle, LinkId,
};
use crate::config::Config;
use crate::frame::HelloFrame;
use crate::identity::NodeId;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// DNS-SD service type for an application id
pub fn service_type(app_id: u32) -> String {
    format!("_meshlink1-app{}._tcp.", app_id)
}

/// Platform service registration and browsing (mDNS / NSD)
///
/// Resolved instances are reported back through
/// [`WifiTransportHandle::on_service_resolved`].
#[cfg_attr(test, mockall::automock)]
pub trait ServiceDiscovery: Send {
    /// Browse for `service_type`; also publish `instance_name` when a port is given
    fn start(&mut self, service_type: &str, instance_name: &str, port: Option<u16>);
    fn stop(&mut self);
}

/// Discovery backend for hosts that only use static peers
#[derive(Debug, Default)]
pub struct NoServiceDiscovery;

impl ServiceDiscovery for NoServiceDiscovery {
    fn start(&mut self, service_type: &str, _instance_name: &str, _port: Option<u16>) {
        debug!("No service discovery for {}", service_type);
    }

    fn stop(&mut self) {}
}

#[derive(Debug)]
enum WifiCommand {
    ServiceResolved { name: String, addr: SocketAddr },
    Connect(SocketAddr),
    Accepted { stream: TcpStream, addr: SocketAddr },
    LocalAddr(oneshot::Sender<Option<SocketAddr>>),
}

/// Handle to a running Wi-Fi transport
#[derive(Debug, Clone)]
pub struct WifiTransportHandle {
    commands: mpsc::UnboundedSender<WifiCommand>,
    transport: TransportHandle,
}

impl WifiTransportHandle {
    /// Lifecycle handle used by the aggregate transport
    pub fn transport_handle(&self) -> TransportHandle {
        self.transport.clone()
    }

    /// A service instance was resolved by the platform discovery
    pub fn on_service_resolved(&self, name: impl Into<String>, addr: SocketAddr) -> Result<(), TransportError> {
        self.post(WifiCommand::ServiceResolved {
            name: name.into(),
            addr,
        })
    }

    /// Dial a known address directly, bypassing discovery
    pub fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        self.post(WifiCommand::Connect(addr))
    }

    /// Address the listener is bound to, if the transport is running
    pub async fn local_addr(&self) -> Result<Option<SocketAddr>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(WifiCommand::LocalAddr(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| TransportError::NotRunning("Wifi".to_string()))
    }

    fn post(&self, command: WifiCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::NotRunning("Wifi".to_string()))
    }
}

struct WifiLink {
    control: LinkControl,
    /// Node id announced by discovery for outgoing links
    expected: Option<NodeId>,
    /// Set once the link has been reported as connected
    handle: Option<LinkHandle>,
}

impl WifiLink {
    fn is_for(&self, node_id: NodeId) -> bool {
        self.expected == Some(node_id)
            || self.handle.as_ref().map(|h| h.node_id()) == Some(node_id)
    }
}

/// Wi-Fi transport actor; all state lives on its task
pub struct WifiTransport {
    app_id: u32,
    node_id: NodeId,
    config: Arc<Config>,
    discovery: Box<dyn ServiceDiscovery>,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands_tx: mpsc::UnboundedSender<WifiCommand>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    running: bool,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    links: HashMap<LinkId, WifiLink>,
}

impl WifiTransport {
    /// Spawn the transport task; it starts in the stopped state
    pub fn spawn(
        app_id: u32,
        node_id: NodeId,
        config: Arc<Config>,
        discovery: Box<dyn ServiceDiscovery>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> WifiTransportHandle {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();

        let transport = WifiTransport {
            app_id,
            node_id,
            config,
            discovery,
            events,
            commands_tx: commands_tx.clone(),
            link_events_tx,
            running: false,
            local_addr: None,
            accept_task: None,
            links: HashMap::new(),
        };
        tokio::spawn(transport.run(lifecycle_rx, commands_rx, link_events_rx));

        WifiTransportHandle {
            commands: commands_tx,
            transport: TransportHandle::new(TransportKind::Wifi, lifecycle_tx),
        }
    }

    async fn run(
        mut self,
        mut lifecycle: mpsc::UnboundedReceiver<TransportCommand>,
        mut commands: mpsc::UnboundedReceiver<WifiCommand>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                command = lifecycle.recv() => match command {
                    Some(TransportCommand::Start) => self.start().await,
                    Some(TransportCommand::Stop) => self.stop(),
                    Some(command) => debug!("Wifi transport ignores {}", command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = link_events.recv() => self.handle_link_event(event),
            }
        }
        debug!("Wifi transport task finished");
    }

    async fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;

        let listen_addr = self.config.wifi.listen_addr;
        let port = match TcpListener::bind(listen_addr).await {
            Ok(listener) => {
                self.local_addr = listener.local_addr().ok();
                let commands = self.commands_tx.clone();
                self.accept_task = Some(tokio::spawn(accept_loop(listener, commands)));
                self.local_addr.map(|addr| addr.port())
            }
            Err(e) => {
                warn!("Wifi listener bind on {} failed, browsing only: {}", listen_addr, e);
                None
            }
        };
        info!("Wifi transport started on {:?}", self.local_addr);

        let instance = self.node_id.to_string();
        self.discovery
            .start(&service_type(self.app_id), &instance, port);
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.local_addr = None;
        self.discovery.stop();

        for link in self.links.values() {
            link.control.disconnect();
        }
        info!("Wifi transport stopped");
    }

    fn handle_command(&mut self, command: WifiCommand) {
        match command {
            WifiCommand::ServiceResolved { name, addr } => self.on_service_resolved(&name, addr),
            WifiCommand::Connect(addr) => {
                if !self.running {
                    warn!("Wifi transport not running, not dialing {}", addr);
                    return;
                }
                self.dial(addr, None);
            }
            WifiCommand::Accepted { stream, addr } => {
                if !self.running {
                    debug!("Dropping connection from {} while stopped", addr);
                    return;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", addr, e);
                }
                debug!("Accepted Wifi connection from {}", addr);
                self.add_link(ready_stream(stream), None);
            }
            WifiCommand::LocalAddr(reply) => {
                let _ = reply.send(self.local_addr);
            }
        }
    }

    fn on_service_resolved(&mut self, name: &str, addr: SocketAddr) {
        if !self.running {
            return;
        }
        let Ok(node_id) = name.parse::<NodeId>() else {
            debug!("Ignoring service instance with foreign name {:?}", name);
            return;
        };
        if node_id == self.node_id {
            return;
        }
        if self.links.values().any(|link| link.is_for(node_id)) {
            debug!("Already linked to node {}", node_id);
            return;
        }
        debug!("Resolved node {} at {}", node_id, addr);
        self.dial(addr, Some(node_id));
    }

    fn dial(&mut self, addr: SocketAddr, expected: Option<NodeId>) {
        let timeout = self.config.timeout_interval();
        let connect = async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            Ok::<BoxedStream, io::Error>(Box::new(stream))
        };
        self.add_link(connect, expected);
    }

    fn add_link<F>(&mut self, connect: F, expected: Option<NodeId>)
    where
        F: std::future::Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        let hello = HelloFrame {
            node_id: self.node_id,
            peer: None,
        };
        let control = spawn_link(
            LinkKind::Wifi,
            connect,
            hello,
            LinkConfig::with_keepalive(&self.config),
            self.link_events_tx.clone(),
        );
        self.links.insert(
            control.id(),
            WifiLink {
                control,
                expected,
                handle: None,
            },
        );
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event.kind {
            LinkEventKind::Connected(hello) => {
                let running = self.running;
                let own_id = self.node_id;
                let Some(link) = self.links.get_mut(&event.link) else {
                    return;
                };
                if !running {
                    link.control.disconnect();
                    return;
                }
                if hello.node_id == own_id {
                    debug!("{} leads back to this node, closing", event.link);
                    link.control.disconnect();
                    return;
                }
                let handle = link.control.handle(hello.node_id);
                link.handle = Some(handle.clone());
                debug!("Wifi link connected: {}", handle);
                let _ = self.events.send(TransportEvent::LinkConnected(handle));
            }
            LinkEventKind::Frame(data) => {
                if !self.running {
                    return;
                }
                if let Some(handle) = self.links.get(&event.link).and_then(|l| l.handle.clone()) {
                    let _ = self.events.send(TransportEvent::FrameReceived { link: handle, data });
                }
            }
            LinkEventKind::Control(frame) => {
                debug!("Wifi link ignores {} frame", frame.kind());
            }
            LinkEventKind::Disconnected { was_connected } => {
                let Some(link) = self.links.remove(&event.link) else {
                    return;
                };
                if let (true, Some(handle)) = (was_connected, link.handle) {
                    debug!("Wifi link disconnected: {}", handle);
                    let _ = self.events.send(TransportEvent::LinkDisconnected(handle));
                }
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, commands: mpsc::UnboundedSender<WifiCommand>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if commands.send(WifiCommand::Accepted { stream, addr }).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Wifi accept failed: {}", e);
                break;
            }
        }
    }
}
