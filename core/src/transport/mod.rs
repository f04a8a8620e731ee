// Transport module: concrete transports, links and the aggregate above them

pub mod abstraction;
pub mod aggregate;
pub mod bluetooth;
pub mod link;
pub mod wifi;

pub use abstraction::{
    LinkKind, TransportCommand, TransportError, TransportEvent, TransportHandle, TransportKind,
};
pub use aggregate::{AggLink, AggLinkId, AggTransport, AggTransportHandle, MeshEvent};
pub use bluetooth::{BluetoothPlatform, BtStreamProvider, BtTransport, BtTransportHandle};
pub use link::{BoxedStream, LinkHandle, LinkId, LinkState, LinkStream};
pub use wifi::{NoServiceDiscovery, ServiceDiscovery, WifiTransport, WifiTransportHandle};
