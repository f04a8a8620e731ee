// Meshlink Core: transport aggregation for local P2P meshes
//
// Peers are found over Wi-Fi service discovery and Bluetooth, linked with
// a small framed protocol, and presented to the application as one logical
// link per node.

pub mod config;
pub mod frame;
pub mod identity;
pub mod mesh;
pub mod transport;

pub use config::{BluetoothConfig, Config, ConfigError, WifiConfig};
pub use frame::{BtAddress, CodecError, Frame, FrameKind, Peer};
pub use identity::{NodeId, NodeIdError};
pub use mesh::{Mesh, MeshBuilder};
pub use transport::{
    AggLink, AggLinkId, LinkHandle, LinkKind, MeshEvent, TransportError, TransportKind,
};

use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Install a `tracing` subscriber for the process
///
/// `RUST_LOG` wins over `default_filter`. Calling this more than once, or
/// after the host installed its own subscriber, does nothing.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
