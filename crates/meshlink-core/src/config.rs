//! Transport configuration
//!
//! A single `MeshConfig` is built once and handed to every component that
//! needs it. The two envelope caps stay independent: type tags are always tiny
//! while bodies carry real data.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{MeshError, MeshResult};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Ceiling on the encoded type discriminator length
pub const BLOCK_SIZE_CAP: usize = 8192;

/// Ceiling on the encoded body length
pub const MESSAGE_SIZE_CAP: usize = 16384;

/// Default payload per write: 23-byte default ATT MTU minus the 3-byte header
pub const DEFAULT_FRAGMENT_SIZE: usize = 20;

// ----------------------------------------------------------------------------
// Envelope Limits
// ----------------------------------------------------------------------------

/// Size caps enforced by the packet codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum `type_len`
    pub block_size_cap: usize,
    /// Maximum `body_len`
    pub message_size_cap: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            block_size_cap: BLOCK_SIZE_CAP,
            message_size_cap: MESSAGE_SIZE_CAP,
        }
    }
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Configuration for the MeshLink transport engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Default fragment size used until a link negotiates its own MTU
    pub fragment_size: usize,
    /// Bounded wait for a single radio callback
    pub operation_timeout: Duration,
    /// Bounded wait for a whole multi-step handshake
    pub transaction_timeout: Duration,
    /// Envelope size caps
    pub limits: Limits,
    /// Capacity of the per-link inbound reassembly buffer in bytes
    pub reassembly_capacity: usize,
    /// How long an operation may hold the radio before the queue logs a stall
    pub release_warning: Duration,
    /// Capacity of broadcast event hubs
    pub event_capacity: usize,
    /// MTU requested from peers after connecting
    pub requested_mtu: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            operation_timeout: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(120),
            limits: Limits::default(),
            reassembly_capacity: 4096,
            release_warning: Duration::from_secs(10),
            event_capacity: 64,
            requested_mtu: 512,
        }
    }
}

impl MeshConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default fragment size
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Set the per-operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the per-transaction timeout
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Set the envelope limits
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the inbound reassembly buffer capacity
    pub fn with_reassembly_capacity(mut self, capacity: usize) -> Self {
        self.reassembly_capacity = capacity;
        self
    }

    /// Set the stall warning threshold
    pub fn with_release_warning(mut self, warning: Duration) -> Self {
        self.release_warning = warning;
        self
    }

    /// Set the MTU requested after connecting
    pub fn with_requested_mtu(mut self, mtu: usize) -> Self {
        self.requested_mtu = mtu;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> MeshResult<()> {
        if self.fragment_size == 0 {
            return Err(MeshError::config_error("fragment_size must be > 0"));
        }
        if self.limits.block_size_cap == 0 || self.limits.message_size_cap == 0 {
            return Err(MeshError::config_error("size caps must be > 0"));
        }
        if self.reassembly_capacity == 0 {
            return Err(MeshError::config_error("reassembly_capacity must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(MeshError::config_error("event_capacity must be > 0"));
        }
        if self.operation_timeout.is_zero() || self.transaction_timeout.is_zero() {
            return Err(MeshError::config_error("timeouts must be non-zero"));
        }
        Ok(())
    }
}
