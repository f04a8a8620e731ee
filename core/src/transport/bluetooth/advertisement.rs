//! Bluetooth discovery identifiers
//!
//! - per-application RFCOMM service UUIDs; a switcher port is an index into them
//! - the BLE manufacturer-data payload advertising address and free ports
//!
//! Manufacturer data format (27 bytes, big-endian):
//! [1 byte]  version (1)
//! [4 bytes] application id
//! [6 bytes] Bluetooth address
//! [4 bytes] free port bitmask, bit n set = port n free
//! [12 bytes] zero padding

use crate::frame::BtAddress;
use thiserror::Error;
use uuid::Uuid;

pub const MANUFACTURER_DATA_VERSION: u8 = 1;
pub const MANUFACTURER_DATA_LEN: usize = 27;

/// Version + app id + address + port mask
const MANUFACTURER_DATA_MIN_LEN: usize = 1 + 4 + 6 + 4;

/// Highest port number representable in the advertisement mask
pub const PORT_NUMBER_MAX: u32 = 30;

/// Service UUID templates; the low 32 bits carry the application id
const SERVICE_UUID_TEMPLATES: [u128; 7] = [
    0x1B9839E4_040B_48B2_AE5F_61B6_0000_0000,
    0x6FB34FD8_579F_4915_88FF_71B2_0000_0000,
    0x8CC0C5A1_1E22_4C95_89D7_3639_0000_0000,
    0x71932FDF_9694_46BE_8943_E16C_0000_0000,
    0x9F29B4E8_DAF0_48DD_833B_37E8_0000_0000,
    0xB82B32ED_AF2C_4A99_B8C3_FBE4_0000_0000,
    0x0707A437_7DFE_4FA0_92F5_46D5_0000_0000,
];

/// RFCOMM service UUIDs for an application, indexed by port
pub fn service_uuids(app_id: u32) -> Vec<Uuid> {
    SERVICE_UUID_TEMPLATES
        .iter()
        .map(|template| Uuid::from_u128(template | app_id as u128))
        .collect()
}

/// Map switcher ports to service UUIDs, skipping ports with no service
pub fn uuids_for_ports(uuids: &[Uuid], ports: &[u32]) -> Vec<Uuid> {
    ports
        .iter()
        .filter_map(|&port| uuids.get(port as usize).copied())
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdvertisementError {
    #[error("Advertisement too short: {0} bytes")]
    TooShort(usize),
    #[error("Unsupported advertisement version: {0}")]
    UnsupportedVersion(u8),
}

/// Payload of a BLE advertisement announcing this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub app_id: u32,
    pub address: BtAddress,
    pub ports: Vec<u32>,
}

impl ManufacturerData {
    pub fn new(app_id: u32, address: BtAddress, ports: Vec<u32>) -> Self {
        Self {
            app_id,
            address,
            ports,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mask = self
            .ports
            .iter()
            .filter(|&&port| port <= PORT_NUMBER_MAX)
            .fold(0u32, |mask, &port| mask | (1 << port));

        let mut data = Vec::with_capacity(MANUFACTURER_DATA_LEN);
        data.push(MANUFACTURER_DATA_VERSION);
        data.extend_from_slice(&self.app_id.to_be_bytes());
        data.extend_from_slice(self.address.as_bytes());
        data.extend_from_slice(&mask.to_be_bytes());
        data.resize(MANUFACTURER_DATA_LEN, 0);
        data
    }

    pub fn parse(data: &[u8]) -> Result<Self, AdvertisementError> {
        if data.len() < MANUFACTURER_DATA_MIN_LEN {
            return Err(AdvertisementError::TooShort(data.len()));
        }
        if data[0] != MANUFACTURER_DATA_VERSION {
            return Err(AdvertisementError::UnsupportedVersion(data[0]));
        }

        let app_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let mut address = [0u8; 6];
        address.copy_from_slice(&data[5..11]);
        let mask = u32::from_be_bytes([data[11], data[12], data[13], data[14]]);
        let ports = (0..32).filter(|bit| mask & (1 << bit) != 0).collect();

        Ok(Self {
            app_id,
            address: BtAddress::new(address),
            ports,
        })
    }
}
