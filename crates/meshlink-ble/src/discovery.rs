//! Discovery advertisements and luid rotation
//!
//! Nodes advertise their current luid as service data under
//! [`LUID_SERVICE_UUID`]. Scanners decode it to decide whether a device is
//! worth connecting to.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use meshlink_core::Luid;
use tracing::debug;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// MeshLink GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4D4C0001_8E2B_4C47_A4D1_6F0E5B3C2A19);

/// Characteristic the central writes to
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x4D4C0002_8E2B_4C47_A4D1_6F0E5B3C2A19);

/// Characteristic the peripheral notifies on
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x4D4C0003_8E2B_4C47_A4D1_6F0E5B3C2A19);

/// Service data key carrying the advertiser's luid
pub const LUID_SERVICE_UUID: Uuid = Uuid::from_u128(0x4D4C0004_8E2B_4C47_A4D1_6F0E5B3C2A19);

// ----------------------------------------------------------------------------
// Advertisements
// ----------------------------------------------------------------------------

/// One observation of a nearby device
#[derive(Debug, Clone)]
pub struct Advertisement<D> {
    pub device: D,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub rssi: Option<i16>,
}

impl<D> Advertisement<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            service_data: HashMap::new(),
            rssi: None,
        }
    }

    pub fn with_service_data(mut self, uuid: Uuid, data: Vec<u8>) -> Self {
        self.service_data.insert(uuid, data);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Shorthand for [`decode_luid`]
    pub fn luid(&self) -> Option<Luid> {
        decode_luid(self)
    }
}

/// Extract the advertised luid; `None` when absent or not exactly 16 bytes
pub fn decode_luid<D>(advertisement: &Advertisement<D>) -> Option<Luid> {
    let data = advertisement.service_data.get(&LUID_SERVICE_UUID)?;
    let luid = Luid::from_slice(data);
    if luid.is_none() {
        debug!(
            "Ignoring malformed luid service data {}",
            hex::encode(data)
        );
    }
    luid
}

/// Service data entry advertising `luid`
pub fn luid_service_data(luid: Luid) -> (Uuid, Vec<u8>) {
    (LUID_SERVICE_UUID, luid.as_bytes().to_vec())
}

// ----------------------------------------------------------------------------
// Luid Rotation
// ----------------------------------------------------------------------------

/// The local node's current luid
#[derive(Debug)]
pub struct LuidRotation {
    current: Mutex<Luid>,
}

impl LuidRotation {
    pub fn new() -> Self {
        Self::starting_at(Luid::random())
    }

    pub fn starting_at(luid: Luid) -> Self {
        Self {
            current: Mutex::new(luid),
        }
    }

    pub fn current(&self) -> Luid {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the luid with a fresh one, returning the new value
    pub fn rotate(&self) -> Luid {
        let next = Luid::random();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Rotating luid {} -> {}", *current, next);
        *current = next;
        next
    }

    /// Service data for the current luid
    pub fn service_data(&self) -> (Uuid, Vec<u8>) {
        luid_service_data(self.current())
    }
}

impl Default for LuidRotation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luid_round_trips_through_service_data() {
        let luid = Luid::random();
        let (uuid, data) = luid_service_data(luid);
        let advertisement = Advertisement::new("device").with_service_data(uuid, data);
        assert_eq!(decode_luid(&advertisement), Some(luid));
    }

    #[test]
    fn test_missing_or_short_luid_is_undecodable() {
        let empty = Advertisement::new(1u8);
        assert_eq!(empty.luid(), None);

        let short = Advertisement::new(1u8).with_service_data(LUID_SERVICE_UUID, vec![0; 15]);
        assert_eq!(short.luid(), None);

        let other = Advertisement::new(1u8).with_service_data(SERVICE_UUID, vec![0; 16]);
        assert_eq!(other.luid(), None);
    }

    #[test]
    fn test_rotation_changes_luid() {
        let start = Luid::random();
        let rotation = LuidRotation::starting_at(start);
        assert_eq!(rotation.current(), start);
        let next = rotation.rotate();
        assert_ne!(next, start);
        assert_eq!(rotation.current(), next);
        assert_eq!(rotation.service_data().1, next.as_bytes().to_vec());
    }
}
