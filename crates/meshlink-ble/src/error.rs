//! Error types for the BLE transport

use meshlink_core::errors::TransportError;
use meshlink_core::MeshError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE radios
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Unknown device: {device}")]
    UnknownDevice { device: String },

    #[error("Link {link} is closed")]
    LinkClosed { link: String },

    #[error("Radio refused: {0}")]
    Refused(String),

    #[error("btleplug error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleError> for MeshError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Btleplug(btleplug::Error::PermissionDenied) => {
                MeshError::Transport(TransportError::PermissionDenied)
            }
            BleError::LinkClosed { .. } => MeshError::Transport(TransportError::StreamClosed),
            other => MeshError::radio(other.to_string()),
        }
    }
}
