//! Message types and typed bodies
//!
//! Every packet on a link is tagged with a `MessageType`. Decoding dispatches
//! on the tag with an exhaustive match, so adding a message type forces every
//! dispatch site to handle it.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::FramingError;
use crate::types::Luid;
use crate::{MeshError, MeshResult};

/// Width of a content hash carried in block headers and hash declarations
pub const HASH_LEN: usize = 32;

/// Width of an identity public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Width of an identity signature
pub const SIGNATURE_LEN: usize = 64;

// ----------------------------------------------------------------------------
// Message Type
// ----------------------------------------------------------------------------

/// Type discriminator carried in every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Advertise = 0x01,
    Luid = 0x02,
    ElectLeader = 0x03,
    Upgrade = 0x04,
    BlockHeader = 0x05,
    BlockSequence = 0x06,
    DeclareHashes = 0x07,
    Identity = 0x08,
    Ack = 0x09,
}

impl MessageType {
    /// All message types, in tag order
    pub const ALL: [MessageType; 9] = [
        MessageType::Advertise,
        MessageType::Luid,
        MessageType::ElectLeader,
        MessageType::Upgrade,
        MessageType::BlockHeader,
        MessageType::BlockSequence,
        MessageType::DeclareHashes,
        MessageType::Identity,
        MessageType::Ack,
    ];

    /// Wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a message type by wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Advertise => "advertise",
            MessageType::Luid => "luid",
            MessageType::ElectLeader => "elect-leader",
            MessageType::Upgrade => "upgrade",
            MessageType::BlockHeader => "block-header",
            MessageType::BlockSequence => "block-sequence",
            MessageType::DeclareHashes => "declare-hashes",
            MessageType::Identity => "identity",
            MessageType::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| MeshError::config_error(format!("Unknown message type {}", s)))
    }
}

// ----------------------------------------------------------------------------
// Type Header
// ----------------------------------------------------------------------------

/// The type-discriminator sub-message stored in `type_bytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeHeader {
    pub message_type: MessageType,
}

impl TypeHeader {
    /// Encoded length of a type header
    pub const LEN: usize = 1;

    pub fn new(message_type: MessageType) -> Self {
        Self { message_type }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        [self.message_type.tag()]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        let [tag] = bytes else {
            return Err(FramingError::MalformedTypeHeader {
                reason: format!("expected {} byte, got {}", Self::LEN, bytes.len()),
            });
        };
        MessageType::from_tag(*tag)
            .map(Self::new)
            .ok_or(FramingError::UnknownMessageType { tag: *tag })
    }
}

// ----------------------------------------------------------------------------
// Message Bodies
// ----------------------------------------------------------------------------

/// Announces which services this node provides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisePacket {
    pub provides: Vec<u32>,
}

/// Exchanges the sender's current luid, optionally as a commitment hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuidPacket {
    pub luid: Luid,
    pub hashed: Option<Vec<u8>>,
    pub protocol_version: u32,
}

/// One round of the leader election that decides who upgrades the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectLeaderPacket {
    pub salt: Vec<u8>,
    pub provides: u32,
    pub tiebreaker: Luid,
    pub reveal: bool,
}

/// Offers a higher-bandwidth session to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePacket {
    pub provides: u32,
    pub session_id: u32,
    pub metadata: BTreeMap<String, String>,
    pub from: Option<Luid>,
}

/// Describes a block of data about to be streamed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderPacket {
    pub application: String,
    pub session_id: u32,
    pub hashes: Vec<Vec<u8>>,
    pub end_of_stream: bool,
    pub to_disk: bool,
}

/// One piece of a block's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSequencePacket {
    pub sequence: u32,
    pub data: Vec<u8>,
    pub end: bool,
}

/// Declares which message hashes the sender already has
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareHashesPacket {
    pub optout: bool,
    pub hashes: Vec<Vec<u8>>,
}

/// Carries a signed identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPacket {
    pub name: String,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub end: bool,
}

/// Generic acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPacket {
    pub success: bool,
    pub message: Option<String>,
    pub status: i32,
}

fn hashes_well_formed(hashes: &[Vec<u8>]) -> bool {
    hashes.iter().all(|h| h.len() == HASH_LEN)
}

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// A decoded packet body, tagged by its message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Advertise(AdvertisePacket),
    Luid(LuidPacket),
    ElectLeader(ElectLeaderPacket),
    Upgrade(UpgradePacket),
    BlockHeader(BlockHeaderPacket),
    BlockSequence(BlockSequencePacket),
    DeclareHashes(DeclareHashesPacket),
    Identity(IdentityPacket),
    Ack(AckPacket),
}

impl Payload {
    /// Message type of this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Advertise(_) => MessageType::Advertise,
            Payload::Luid(_) => MessageType::Luid,
            Payload::ElectLeader(_) => MessageType::ElectLeader,
            Payload::Upgrade(_) => MessageType::Upgrade,
            Payload::BlockHeader(_) => MessageType::BlockHeader,
            Payload::BlockSequence(_) => MessageType::BlockSequence,
            Payload::DeclareHashes(_) => MessageType::DeclareHashes,
            Payload::Identity(_) => MessageType::Identity,
            Payload::Ack(_) => MessageType::Ack,
        }
    }

    /// Application-level sanity checks run before encoding
    pub fn validate(&self) -> bool {
        match self {
            Payload::Advertise(p) => !p.provides.is_empty(),
            Payload::Luid(p) => p.hashed.as_ref().map_or(true, |h| h.len() == HASH_LEN),
            Payload::ElectLeader(p) => !p.salt.is_empty() && p.salt.len() <= 64,
            Payload::Upgrade(_) => true,
            Payload::BlockHeader(p) => {
                (p.end_of_stream || !p.application.is_empty()) && hashes_well_formed(&p.hashes)
            }
            Payload::BlockSequence(p) => p.end || !p.data.is_empty(),
            Payload::DeclareHashes(p) => hashes_well_formed(&p.hashes),
            Payload::Identity(p) => {
                p.end
                    || (!p.name.is_empty()
                        && p.public_key.len() == PUBLIC_KEY_LEN
                        && p.signature.len() == SIGNATURE_LEN)
            }
            Payload::Ack(_) => true,
        }
    }

    /// Serialize the body (without envelope)
    pub fn to_body(&self) -> MeshResult<Vec<u8>> {
        let bytes = match self {
            Payload::Advertise(p) => bincode::serialize(p)?,
            Payload::Luid(p) => bincode::serialize(p)?,
            Payload::ElectLeader(p) => bincode::serialize(p)?,
            Payload::Upgrade(p) => bincode::serialize(p)?,
            Payload::BlockHeader(p) => bincode::serialize(p)?,
            Payload::BlockSequence(p) => bincode::serialize(p)?,
            Payload::DeclareHashes(p) => bincode::serialize(p)?,
            Payload::Identity(p) => bincode::serialize(p)?,
            Payload::Ack(p) => bincode::serialize(p)?,
        };
        Ok(bytes)
    }

    /// Decode a body with the decoder for `message_type`
    pub fn from_body(message_type: MessageType, body: &[u8]) -> MeshResult<Self> {
        let payload = match message_type {
            MessageType::Advertise => Payload::Advertise(bincode::deserialize(body)?),
            MessageType::Luid => Payload::Luid(bincode::deserialize(body)?),
            MessageType::ElectLeader => Payload::ElectLeader(bincode::deserialize(body)?),
            MessageType::Upgrade => Payload::Upgrade(bincode::deserialize(body)?),
            MessageType::BlockHeader => Payload::BlockHeader(bincode::deserialize(body)?),
            MessageType::BlockSequence => Payload::BlockSequence(bincode::deserialize(body)?),
            MessageType::DeclareHashes => Payload::DeclareHashes(bincode::deserialize(body)?),
            MessageType::Identity => Payload::Identity(bincode::deserialize(body)?),
            MessageType::Ack => Payload::Ack(bincode::deserialize(body)?),
        };
        Ok(payload)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
