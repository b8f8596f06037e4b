//! Core types for MeshLink
//!
//! Newtypes for the rotating peer identifier and operation priorities.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MeshError;

// ----------------------------------------------------------------------------
// Logical Peer Identifier
// ----------------------------------------------------------------------------

/// Rotating logical identifier for a peer, carried in discovery advertisements.
///
/// Peers are always addressed by luid rather than by hardware address, which
/// changes under the platform's address randomization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Luid(Uuid);

impl Luid {
    /// Size of the luid on the wire
    pub const LEN: usize = 16;

    /// Wrap an existing uuid
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random luid
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a luid from exactly 16 raw bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Get the underlying uuid
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for Luid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for Luid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Luid {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| MeshError::config_error(format!("Invalid luid {}: {}", s, e)))
    }
}

// ----------------------------------------------------------------------------
// Operation Priority
// ----------------------------------------------------------------------------

/// Priority of a queued radio operation. Higher priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luid_from_slice_requires_sixteen_bytes() {
        let luid = Luid::random();
        assert_eq!(Luid::from_slice(luid.as_bytes()), Some(luid));
        assert_eq!(Luid::from_slice(&luid.as_bytes()[..15]), None);
        assert_eq!(Luid::from_slice(&[0u8; 17]), None);
    }

    #[test]
    fn test_luid_display_parses_back() {
        let luid = Luid::random();
        let parsed: Luid = luid.to_string().parse().unwrap();
        assert_eq!(parsed, luid);
        assert!("not-a-luid".parse::<Luid>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
