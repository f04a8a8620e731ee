//! Frame and peer snapshot types

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BtAddressError {
    #[error("Invalid Bluetooth address: {0}")]
    Invalid(String),
}

/// 6-byte Bluetooth hardware address
///
/// The all-zero address stands for "unknown", which is what devices that hide
/// their address report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BtAddress(pub [u8; 6]);

impl BtAddress {
    pub const UNSET: BtAddress = BtAddress([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BtAddress {
    type Err = BtAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| BtAddressError::Invalid(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| BtAddressError::Invalid(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(BtAddressError::Invalid(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// A Bluetooth mesh participant as seen by the switcher
///
/// Treated as an immutable value: updates build a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: BtAddress,
    /// Device cannot act as a BLE peripheral (no advertising)
    pub legacy: bool,
    /// Currently free listening slots
    pub ports: Vec<u32>,
}

impl Peer {
    pub fn new(address: BtAddress, legacy: bool, ports: Vec<u32>) -> Self {
        Self {
            address,
            legacy,
            ports,
        }
    }

    pub fn with_address(&self, address: BtAddress) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }

    pub fn with_legacy(&self, legacy: bool) -> Self {
        Self {
            legacy,
            ..self.clone()
        }
    }

    pub fn with_ports(&self, ports: Vec<u32>) -> Self {
        Self {
            ports,
            ..self.clone()
        }
    }
}

/// First frame on every link, sent by both sides without waiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloFrame {
    pub node_id: NodeId,
    /// Bluetooth links carry the sender's peer snapshot
    pub peer: Option<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFrame {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsFrame {
    pub address: BtAddress,
    pub ports: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedFrame {
    pub peer: Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedFrame {
    pub address: BtAddress,
}

/// Message carried inside one length-prefixed frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello(HelloFrame),
    Payload(PayloadFrame),
    Heartbeat,
    Ports(PortsFrame),
    Connected(ConnectedFrame),
    Disconnected(DisconnectedFrame),
}

/// Discriminator of a [`Frame`], used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Hello,
    Payload,
    Heartbeat,
    Ports,
    Connected,
    Disconnected,
}

impl Frame {
    pub fn payload(data: Vec<u8>) -> Self {
        Frame::Payload(PayloadFrame { payload: data })
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Hello(_) => FrameKind::Hello,
            Frame::Payload(_) => FrameKind::Payload,
            Frame::Heartbeat => FrameKind::Heartbeat,
            Frame::Ports(_) => FrameKind::Ports,
            Frame::Connected(_) => FrameKind::Connected,
            Frame::Disconnected(_) => FrameKind::Disconnected,
        }
    }

    /// Control frames consumed by the Bluetooth switcher
    pub fn is_switcher_control(&self) -> bool {
        matches!(
            self,
            Frame::Ports(_) | Frame::Connected(_) | Frame::Disconnected(_)
        )
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Hello => write!(f, "HELLO"),
            FrameKind::Payload => write!(f, "PAYLOAD"),
            FrameKind::Heartbeat => write!(f, "HEARTBEAT"),
            FrameKind::Ports => write!(f, "PORTS"),
            FrameKind::Connected => write!(f, "CONNECTED"),
            FrameKind::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}
