//! Transport abstraction layer
//!
//! Defines the kinds, lifecycle commands, events and errors shared by every
//! concrete transport and by the aggregate transport above them.

use super::link::LinkHandle;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Concrete transports the mesh can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP streams found through local service discovery
    Wifi,
    /// RFCOMM streams and BLE relays
    Bluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Wifi => write!(f, "Wifi"),
            TransportKind::Bluetooth => write!(f, "Bluetooth"),
        }
    }
}

/// Physical link kinds; each has a fixed priority, higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Wifi,
    Bluetooth,
    BluetoothLe,
}

impl LinkKind {
    pub fn priority(&self) -> u8 {
        match self {
            LinkKind::Wifi => 10,
            LinkKind::Bluetooth => 20,
            LinkKind::BluetoothLe => 30,
        }
    }

    /// Transport that owns links of this kind
    pub fn transport(&self) -> TransportKind {
        match self {
            LinkKind::Wifi => TransportKind::Wifi,
            LinkKind::Bluetooth | LinkKind::BluetoothLe => TransportKind::Bluetooth,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Wifi => write!(f, "Wifi"),
            LinkKind::Bluetooth => write!(f, "Bluetooth"),
            LinkKind::BluetoothLe => write!(f, "BluetoothLe"),
        }
    }
}

/// Lifecycle commands fanned out to every concrete transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Start,
    Stop,
    /// Application moved to the foreground; discovery may be more aggressive
    Foreground,
    /// Application moved to the background
    Background,
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCommand::Start => write!(f, "Start"),
            TransportCommand::Stop => write!(f, "Stop"),
            TransportCommand::Foreground => write!(f, "Foreground"),
            TransportCommand::Background => write!(f, "Background"),
        }
    }
}

/// Events from a concrete transport to the aggregate transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A link finished its HELLO exchange
    LinkConnected(LinkHandle),
    /// A previously connected link went away
    LinkDisconnected(LinkHandle),
    /// Application payload received on a connected link
    FrameReceived { link: LinkHandle, data: Vec<u8> },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LinkConnected(link) => write!(f, "LinkConnected {{ {} }}", link),
            TransportEvent::LinkDisconnected(link) => {
                write!(f, "LinkDisconnected {{ {} }}", link)
            }
            TransportEvent::FrameReceived { link, data } => write!(
                f,
                "FrameReceived {{ {}, data_len: {} }}",
                link,
                data.len()
            ),
        }
    }
}

/// Lifecycle entry point of a running concrete transport
#[derive(Debug, Clone)]
pub struct TransportHandle {
    kind: TransportKind,
    lifecycle: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(kind: TransportKind, lifecycle: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { kind, lifecycle }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
        self.lifecycle
            .send(command)
            .map_err(|_| TransportError::NotRunning(self.kind.to_string()))
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport task not running: {0}")]
    NotRunning(String),

    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    TransportIoError(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::TransportIoError(e.to_string())
    }
}
