//! Wire protocol: message types, envelope codec and chunk reassembly

pub mod chunked;
pub mod envelope;
pub mod message;

pub use chunked::{chunk_channel, ByteSource, ChunkReader, ChunkWriter};
pub use envelope::{Envelope, EnvelopeCodec, Fragments, Packet, CRC_LEN, HEADER_LEN};
pub use message::{
    AckPacket, AdvertisePacket, BlockHeaderPacket, BlockSequencePacket, DeclareHashesPacket,
    ElectLeaderPacket, IdentityPacket, LuidPacket, MessageType, Payload, TypeHeader,
    UpgradePacket,
};
