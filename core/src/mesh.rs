//! Transport orchestration
//!
//! [`MeshBuilder`] wires the requested concrete transports into one
//! aggregate transport. The resulting [`Mesh`] fans lifecycle calls out to
//! all of them and hands platform code the per-transport handles it needs to
//! report discoveries and accepted streams.

use crate::config::{Config, ConfigError};
use crate::identity::NodeId;
use crate::transport::aggregate::{AggLink, AggTransport, AggTransportHandle, MeshEvent};
use crate::transport::bluetooth::{BluetoothPlatform, BtTransport, BtTransportHandle};
use crate::transport::wifi::{ServiceDiscovery, WifiTransport, WifiTransportHandle};
use crate::transport::TransportError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Collects the transports a mesh should run
pub struct MeshBuilder {
    app_id: u32,
    node_id: NodeId,
    config: Config,
    wifi: Option<Box<dyn ServiceDiscovery>>,
    bluetooth: Option<BluetoothPlatform>,
}

impl MeshBuilder {
    /// `app_id` namespaces discovery so different applications don't link up
    pub fn new(app_id: u32, node_id: NodeId, config: Config) -> Self {
        Self {
            app_id,
            node_id,
            config,
            wifi: None,
            bluetooth: None,
        }
    }

    pub fn with_wifi(mut self, discovery: Box<dyn ServiceDiscovery>) -> Self {
        self.wifi = Some(discovery);
        self
    }

    pub fn with_bluetooth(mut self, platform: BluetoothPlatform) -> Self {
        self.bluetooth = Some(platform);
        self
    }

    /// Spawn every transport and the aggregate above them
    ///
    /// Must be called from within a tokio runtime. Nothing is started yet;
    /// call [`Mesh::start`].
    pub fn build(self) -> Result<(Mesh, mpsc::UnboundedReceiver<MeshEvent>), ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let (transport_events_tx, transport_events_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut transports = Vec::new();

        let wifi = self.wifi.map(|discovery| {
            WifiTransport::spawn(
                self.app_id,
                self.node_id,
                config.clone(),
                discovery,
                transport_events_tx.clone(),
            )
        });
        if let Some(wifi) = &wifi {
            transports.push(wifi.transport_handle());
        }

        let bluetooth = self.bluetooth.map(|platform| {
            BtTransport::spawn(
                self.app_id,
                self.node_id,
                config.clone(),
                platform,
                transport_events_tx.clone(),
            )
        });
        if let Some(bluetooth) = &bluetooth {
            transports.push(bluetooth.transport_handle());
        }

        info!(
            "Mesh for app {} as node {} with {} transports",
            self.app_id,
            self.node_id,
            transports.len()
        );
        let aggregate = AggTransport::spawn(transports, transport_events_rx, events_tx);

        let mesh = Mesh {
            app_id: self.app_id,
            node_id: self.node_id,
            config,
            aggregate,
            wifi,
            bluetooth,
        };
        Ok((mesh, events_rx))
    }
}

/// A running set of transports behind one aggregate
pub struct Mesh {
    app_id: u32,
    node_id: NodeId,
    config: Arc<Config>,
    aggregate: AggTransportHandle,
    wifi: Option<WifiTransportHandle>,
    bluetooth: Option<BtTransportHandle>,
}

impl Mesh {
    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start all transports; a second call before `stop` is ignored
    pub fn start(&self) -> Result<(), TransportError> {
        self.aggregate.start()
    }

    /// Stop all transports, disconnecting every link
    pub fn stop(&self) -> Result<(), TransportError> {
        self.aggregate.stop()
    }

    pub fn on_foreground(&self) -> Result<(), TransportError> {
        self.aggregate.on_foreground()
    }

    pub fn on_background(&self) -> Result<(), TransportError> {
        self.aggregate.on_background()
    }

    /// Logical peers connected right now
    pub async fn peers(&self) -> Result<Vec<AggLink>, TransportError> {
        self.aggregate.peers().await
    }

    pub fn wifi(&self) -> Option<&WifiTransportHandle> {
        self.wifi.as_ref()
    }

    pub fn bluetooth(&self) -> Option<&BtTransportHandle> {
        self.bluetooth.as_ref()
    }
}
