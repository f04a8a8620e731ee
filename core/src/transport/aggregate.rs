//! Aggregate transport
//!
//! Collapses every physical link to the same node into one [`AggLink`] and
//! presents all concrete transports to the application as a single event
//! stream. Members of an aggregate link are kept sorted by descending
//! priority; application sends always go to the first one.

use super::abstraction::{TransportCommand, TransportError, TransportEvent, TransportHandle};
use super::link::{LinkHandle, LinkId};
use crate::identity::NodeId;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Identifies one lifetime of an aggregate link; a node that disconnects and
/// comes back gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggLinkId(u64);

impl AggLinkId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AggLinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agg#{}", self.0)
    }
}

/// Events delivered to the application, once per logical peer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    LinkConnected(AggLink),
    LinkDisconnected(AggLink),
    FrameReceived { link: AggLink, data: Vec<u8> },
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::LinkConnected(link) => write!(f, "LinkConnected {{ {} }}", link),
            MeshEvent::LinkDisconnected(link) => write!(f, "LinkDisconnected {{ {} }}", link),
            MeshEvent::FrameReceived { link, data } => {
                write!(f, "FrameReceived {{ {}, data_len: {} }}", link, data.len())
            }
        }
    }
}

enum AggCommand {
    Lifecycle(TransportCommand),
    Send {
        link: AggLinkId,
        node_id: NodeId,
        data: Vec<u8>,
    },
    Disconnect {
        link: AggLinkId,
        node_id: NodeId,
    },
    Members {
        link: AggLinkId,
        node_id: NodeId,
        reply: oneshot::Sender<Vec<LinkHandle>>,
    },
    Peers(oneshot::Sender<Vec<AggLink>>),
}

/// The application's view of a peer, whatever transports reach it
#[derive(Clone)]
pub struct AggLink {
    id: AggLinkId,
    node_id: NodeId,
    commands: mpsc::UnboundedSender<AggCommand>,
}

impl AggLink {
    pub fn id(&self) -> AggLinkId {
        self.id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Queue `data` on the highest-priority member link
    ///
    /// Does nothing if the link is already torn down.
    pub fn send_frame(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.post(AggCommand::Send {
            link: self.id,
            node_id: self.node_id,
            data,
        })
    }

    /// Disconnect every member link
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.post(AggCommand::Disconnect {
            link: self.id,
            node_id: self.node_id,
        })
    }

    /// Current member links, highest priority first
    pub async fn members(&self) -> Result<Vec<LinkHandle>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.post(AggCommand::Members {
            link: self.id,
            node_id: self.node_id,
            reply,
        })?;
        rx.await.map_err(|_| not_running())
    }

    fn post(&self, command: AggCommand) -> Result<(), TransportError> {
        self.commands.send(command).map_err(|_| not_running())
    }
}

impl fmt::Debug for AggLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggLink")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl PartialEq for AggLink {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AggLink {}

impl fmt::Display for AggLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node {}", self.id, self.node_id)
    }
}

fn not_running() -> TransportError {
    TransportError::NotRunning("aggregate".to_string())
}

/// Application-side control of the aggregate transport
#[derive(Clone)]
pub struct AggTransportHandle {
    commands: mpsc::UnboundedSender<AggCommand>,
}

impl AggTransportHandle {
    pub fn start(&self) -> Result<(), TransportError> {
        self.lifecycle(TransportCommand::Start)
    }

    pub fn stop(&self) -> Result<(), TransportError> {
        self.lifecycle(TransportCommand::Stop)
    }

    pub fn on_foreground(&self) -> Result<(), TransportError> {
        self.lifecycle(TransportCommand::Foreground)
    }

    pub fn on_background(&self) -> Result<(), TransportError> {
        self.lifecycle(TransportCommand::Background)
    }

    /// Currently connected logical peers
    pub async fn peers(&self) -> Result<Vec<AggLink>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(AggCommand::Peers(reply))
            .map_err(|_| not_running())?;
        rx.await.map_err(|_| not_running())
    }

    fn lifecycle(&self, command: TransportCommand) -> Result<(), TransportError> {
        self.commands
            .send(AggCommand::Lifecycle(command))
            .map_err(|_| not_running())
    }
}

struct Members {
    id: AggLinkId,
    links: Vec<LinkHandle>,
}

impl Members {
    /// Insert after members of equal or higher priority
    fn insert(&mut self, link: LinkHandle) -> bool {
        if self.links.iter().any(|l| l.id() == link.id()) {
            return false;
        }
        let at = self
            .links
            .iter()
            .position(|l| l.priority() < link.priority())
            .unwrap_or(self.links.len());
        self.links.insert(at, link);
        true
    }

    fn remove(&mut self, id: LinkId) -> bool {
        let before = self.links.len();
        self.links.retain(|l| l.id() != id);
        self.links.len() != before
    }
}

/// Aggregate transport actor
pub struct AggTransport {
    transports: Vec<TransportHandle>,
    peers: HashMap<NodeId, Members>,
    events: mpsc::UnboundedSender<MeshEvent>,
    commands_tx: mpsc::UnboundedSender<AggCommand>,
    running: bool,
    next_id: u64,
}

impl AggTransport {
    /// Spawn the aggregate over `transports`, which report into `transport_events`
    pub fn spawn(
        transports: Vec<TransportHandle>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> AggTransportHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let aggregate = AggTransport {
            transports,
            peers: HashMap::new(),
            events,
            commands_tx: commands_tx.clone(),
            running: false,
            next_id: 1,
        };
        tokio::spawn(aggregate.run(commands_rx, transport_events));
        AggTransportHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AggCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Unreachable while we hold a sender ourselves
                    None => break,
                },
                else => break,
            }
        }
        debug!("Aggregate transport task finished");
    }

    fn handle_command(&mut self, command: AggCommand) {
        match command {
            AggCommand::Lifecycle(command) => self.lifecycle(command),
            AggCommand::Send {
                link,
                node_id,
                data,
            } => match self.members_of(link, node_id).and_then(|m| m.links.first()) {
                Some(target) => {
                    if let Err(e) = target.send_frame(data) {
                        debug!("Send to {} failed: {}", target, e);
                    }
                }
                None => debug!("{} has no members, dropping frame", link),
            },
            AggCommand::Disconnect { link, node_id } => {
                if let Some(members) = self.members_of(link, node_id) {
                    debug!("Disconnecting {} ({} links)", link, members.links.len());
                    for member in &members.links {
                        member.disconnect();
                    }
                }
            }
            AggCommand::Members {
                link,
                node_id,
                reply,
            } => {
                let links = self
                    .members_of(link, node_id)
                    .map(|m| m.links.clone())
                    .unwrap_or_default();
                let _ = reply.send(links);
            }
            AggCommand::Peers(reply) => {
                let mut peers: Vec<AggLink> = self
                    .peers
                    .iter()
                    .map(|(&node_id, members)| self.agg_link(members.id, node_id))
                    .collect();
                peers.sort_by_key(|p| p.id);
                let _ = reply.send(peers);
            }
        }
    }

    fn lifecycle(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Start if self.running => return,
            TransportCommand::Stop if !self.running => return,
            TransportCommand::Start => self.running = true,
            TransportCommand::Stop => self.running = false,
            TransportCommand::Foreground | TransportCommand::Background => {}
        }
        info!("Aggregate transport: {}", command);
        for transport in &self.transports {
            if let Err(e) = transport.send(command) {
                warn!("{} transport did not take {}: {}", transport.kind(), command, e);
            }
        }
    }

    fn members_of(&self, link: AggLinkId, node_id: NodeId) -> Option<&Members> {
        self.peers.get(&node_id).filter(|m| m.id == link)
    }

    fn agg_link(&self, id: AggLinkId, node_id: NodeId) -> AggLink {
        AggLink {
            id,
            node_id,
            commands: self.commands_tx.clone(),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkConnected(link) => self.on_link_connected(link),
            TransportEvent::LinkDisconnected(link) => self.on_link_disconnected(link),
            TransportEvent::FrameReceived { link, data } => {
                let node_id = link.node_id();
                let Some(members) = self.peers.get(&node_id) else {
                    debug!("Frame from unknown node {}, dropping", node_id);
                    return;
                };
                if !members.links.iter().any(|l| l.id() == link.id()) {
                    debug!("Frame from {} which is not a member, dropping", link);
                    return;
                }
                let agg = self.agg_link(members.id, node_id);
                let _ = self.events.send(MeshEvent::FrameReceived { link: agg, data });
            }
        }
    }

    fn on_link_connected(&mut self, link: LinkHandle) {
        let node_id = link.node_id();
        if !self.peers.contains_key(&node_id) {
            let id = AggLinkId(self.next_id);
            self.next_id += 1;
            self.peers.insert(
                node_id,
                Members {
                    id,
                    links: Vec::new(),
                },
            );
        }
        let Some(members) = self.peers.get_mut(&node_id) else {
            return;
        };

        let first = members.links.is_empty();
        if !members.insert(link.clone()) {
            warn!("{} reported connected twice", link);
            return;
        }
        let id = members.id;
        let count = members.links.len();

        if first {
            info!("Node {} connected via {}", node_id, link.kind());
            let agg = self.agg_link(id, node_id);
            let _ = self.events.send(MeshEvent::LinkConnected(agg));
        } else {
            debug!("Node {} gained {} link ({} total)", node_id, link.kind(), count);
        }
    }

    fn on_link_disconnected(&mut self, link: LinkHandle) {
        let node_id = link.node_id();
        let Some(members) = self.peers.get_mut(&node_id) else {
            warn!("{} disconnected from untracked node", link);
            return;
        };
        if !members.remove(link.id()) {
            warn!("{} disconnected but was not a member", link);
            return;
        }
        if !members.links.is_empty() {
            debug!(
                "Node {} lost {} link, {} remaining",
                node_id,
                link.kind(),
                members.links.len()
            );
            return;
        }

        let id = members.id;
        self.peers.remove(&node_id);
        info!("Node {} disconnected", node_id);
        let agg = self.agg_link(id, node_id);
        let _ = self.events.send(MeshEvent::LinkDisconnected(agg));
    }
}
