//! Bluetooth discovery cycle
//!
//! Alternates BLE scanning with advertising so that two nearby devices running
//! the same cycle eventually see each other:
//!
//! ```text
//! Idle -> BleScanning -> Advertising -> BleScanning ...   (foreground)
//! Idle -> BleScanning -> Advertising -> Idle(idle advertiser) -> ...   (background)
//! ```
//!
//! Devices that cannot advertise run a core-side idle advertiser (a timer)
//! instead. Every step is triggered by the previous scanner or advertiser
//! reporting that it stopped, with or without an error, so an unavailable
//! capability simply advances the cycle to its fallback.

use super::advertisement::ManufacturerData;
use crate::config::BluetoothConfig;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Platform BLE scanner
///
/// Must eventually report the end of every started scan through
/// `BtTransportHandle::scan_stopped`.
#[cfg_attr(test, mockall::automock)]
pub trait Scanner: Send {
    fn start_scan(&mut self, duration: Duration);
    fn stop_scan(&mut self);
}

/// Platform BLE advertiser
///
/// Must eventually report the end of every started advertisement through
/// `BtTransportHandle::advertise_stopped`.
#[cfg_attr(test, mockall::automock)]
pub trait Advertiser: Send {
    /// Whether the device can act as a BLE peripheral
    fn is_supported(&self) -> bool;
    fn start_advertise(&mut self, duration: Duration, data: ManufacturerData);
    fn stop_advertise(&mut self);
    /// Refresh the advertised data of a running advertisement
    fn touch(&mut self, data: ManufacturerData);
}

/// Timer signals fed back into the owning task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySignal {
    IdleElapsed { generation: u64 },
    IdleStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    BleScanning,
    Advertising,
}

/// Stand-in advertiser that only waits
#[derive(Debug)]
struct IdleAdvertiser {
    signals: mpsc::UnboundedSender<DiscoverySignal>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl IdleAdvertiser {
    fn start(&mut self, duration: Duration) {
        if self.timer.is_some() {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let signals = self.signals.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = signals.send(DiscoverySignal::IdleElapsed { generation });
        }));
    }

    fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            let _ = self.signals.send(DiscoverySignal::IdleStopped);
        }
    }

    /// True when the elapsed timer belongs to the running period
    fn elapsed(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.timer.is_none() {
            return false;
        }
        self.timer = None;
        true
    }
}

pub struct DiscoveryManager {
    config: BluetoothConfig,
    scanner: Box<dyn Scanner>,
    advertiser: Box<dyn Advertiser>,
    idle: IdleAdvertiser,
    advertisement: ManufacturerData,
    state: DiscoveryState,
    running: bool,
    foreground: bool,
}

impl DiscoveryManager {
    pub fn new(
        config: BluetoothConfig,
        scanner: Box<dyn Scanner>,
        advertiser: Box<dyn Advertiser>,
        advertisement: ManufacturerData,
        signals: mpsc::UnboundedSender<DiscoverySignal>,
    ) -> Self {
        Self {
            config,
            scanner,
            advertiser,
            idle: IdleAdvertiser {
                signals,
                timer: None,
                generation: 0,
            },
            advertisement,
            state: DiscoveryState::Idle,
            running: false,
            foreground: false,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether BLE advertising works on this device
    pub fn is_peripheral_supported(&self) -> bool {
        self.advertiser.is_supported()
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.state = DiscoveryState::Idle;
        self.next_state();
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.next_state();
    }

    /// Foreground/background switch; restarts the cycle from idle
    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
        if !self.running {
            return;
        }
        self.state = DiscoveryState::Idle;
        self.stop_all();
    }

    /// New address or free ports to advertise
    pub fn set_advertisement(&mut self, advertisement: ManufacturerData) {
        self.advertisement = advertisement;
        self.advertiser.touch(self.advertisement.clone());
    }

    pub fn on_scan_stopped(&mut self, error: bool) {
        if error {
            debug!("BLE scan stopped with error in {:?}", self.state);
        }
        self.next_state();
    }

    pub fn on_advertise_stopped(&mut self, error: bool) {
        if error {
            debug!("BLE advertise stopped with error in {:?}", self.state);
        }
        self.next_state();
    }

    pub fn on_signal(&mut self, signal: DiscoverySignal) {
        match signal {
            DiscoverySignal::IdleElapsed { generation } => {
                if self.idle.elapsed(generation) {
                    self.next_state();
                }
            }
            DiscoverySignal::IdleStopped => self.next_state(),
        }
    }

    fn stop_all(&mut self) {
        self.idle.stop();
        self.scanner.stop_scan();
        self.advertiser.stop_advertise();
    }

    fn next_state(&mut self) {
        if !self.running {
            self.state = DiscoveryState::Idle;
            self.stop_all();
            return;
        }

        match self.state {
            DiscoveryState::Idle => {
                self.state = DiscoveryState::BleScanning;
                self.scanner.start_scan(self.config.ble_scan_duration());
            }
            DiscoveryState::BleScanning => {
                let duration = self.config.ble_advertise_duration(self.foreground);
                if !self.advertiser.is_supported() {
                    let duration = if self.foreground { duration / 2 } else { duration };
                    self.state = DiscoveryState::Idle;
                    self.idle.start(duration);
                    return;
                }
                self.state = DiscoveryState::Advertising;
                self.advertiser
                    .start_advertise(duration, self.advertisement.clone());
            }
            DiscoveryState::Advertising if self.foreground => {
                self.state = DiscoveryState::BleScanning;
                self.scanner.start_scan(self.config.ble_scan_duration());
            }
            DiscoveryState::Advertising => {
                self.state = DiscoveryState::Idle;
                self.idle.start(self.config.ble_idle_background());
            }
        }
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        if let Some(timer) = self.idle.timer.take() {
            timer.abort();
        }
    }
}
