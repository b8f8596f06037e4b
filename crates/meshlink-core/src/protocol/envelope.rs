//! Envelope codec
//!
//! Wire layout, all integers big-endian and unsigned:
//!
//! ```text
//! offset      size      field
//! 0           4         type_len
//! 4           4         body_len
//! 8           type_len  type_bytes   (type header)
//! 8+type_len  body_len  body_bytes
//! ...         4         crc32 over type_len||body_len||type_bytes||body_bytes
//! ```
//!
//! The body is only interpreted after the checksum matches, so any damage to
//! the body or the trailer is reported as a checksum error rather than as a
//! deserialization failure.

use core::slice::Chunks;

use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::config::Limits;
use crate::errors::FramingError;
use crate::protocol::chunked::ByteSource;
use crate::protocol::message::{MessageType, Payload, TypeHeader};
use crate::MeshResult;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Length of the two size headers
pub const HEADER_LEN: usize = 8;

/// Length of the trailing checksum
pub const CRC_LEN: usize = 4;

// ----------------------------------------------------------------------------
// Packet and Envelope
// ----------------------------------------------------------------------------

/// A checksum-verified packet whose body has not been interpreted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

impl Packet {
    /// Decode the body with the decoder registered for its tag
    pub fn into_payload(self) -> MeshResult<Payload> {
        Payload::from_body(self.message_type, &self.body)
    }
}

/// A fully encoded envelope ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_type: MessageType,
    bytes: Vec<u8>,
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Split the envelope into slices of at most `fragment_size` bytes
    pub fn fragments(&self, fragment_size: usize) -> MeshResult<Fragments<'_>> {
        if fragment_size == 0 {
            return Err(FramingError::InvalidFragmentSize {
                size: fragment_size,
            }
            .into());
        }
        Ok(Fragments {
            inner: self.bytes.chunks(fragment_size),
        })
    }
}

/// Lazy, finite sequence of envelope fragments
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    inner: Chunks<'a, u8>,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Fragments<'_> {}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encoder/decoder for the length-prefixed, type-tagged, CRC-validated envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    limits: Limits,
}

impl EnvelopeCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Encode a payload, returning `None` when it fails validation or a cap
    pub fn encode(&self, payload: &Payload) -> Option<Envelope> {
        match self.try_encode(payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("Refusing to encode {} packet: {}", payload.message_type(), e);
                None
            }
        }
    }

    /// Encode a payload, reporting why it was refused
    pub fn try_encode(&self, payload: &Payload) -> MeshResult<Envelope> {
        let message_type = payload.message_type();
        if !payload.validate() {
            return Err(FramingError::ValidationFailed { message_type }.into());
        }
        let body = payload.to_body()?;
        self.encode_raw(message_type, &body)
    }

    /// Frame an already serialized body
    pub fn encode_raw(&self, message_type: MessageType, body: &[u8]) -> MeshResult<Envelope> {
        let type_bytes = TypeHeader::new(message_type).to_bytes();
        self.check_lengths(type_bytes.len(), body.len())?;

        let header = header_bytes(type_bytes.len(), body.len());
        let crc = checksum(&header, &type_bytes, body);

        let mut bytes = Vec::with_capacity(HEADER_LEN + type_bytes.len() + body.len() + CRC_LEN);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&type_bytes);
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&crc.to_be_bytes());

        Ok(Envelope {
            message_type,
            bytes,
        })
    }

    /// Read one envelope from `source` and decode its body
    pub async fn decode<S>(&self, source: &mut S, expected: MessageType) -> MeshResult<Payload>
    where
        S: ByteSource + ?Sized,
    {
        self.read_packet(source, expected).await?.into_payload()
    }

    /// Read and verify one envelope from `source` without decoding its body
    pub async fn read_packet<S>(&self, source: &mut S, expected: MessageType) -> MeshResult<Packet>
    where
        S: ByteSource + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        source.read_exact(&mut header).await?;
        let (type_len, body_len) = split_header(&header);
        self.check_lengths(type_len, body_len)?;

        let mut type_bytes = vec![0u8; type_len];
        source.read_exact(&mut type_bytes).await?;
        let message_type = check_type(&type_bytes, expected)?;

        let mut body = vec![0u8; body_len];
        source.read_exact(&mut body).await?;

        let mut crc = [0u8; CRC_LEN];
        source.read_exact(&mut crc).await?;
        verify_checksum(u32::from_be_bytes(crc), checksum(&header, &type_bytes, &body))?;

        debug!("Decoded {} envelope ({} byte body)", message_type, body_len);
        Ok(Packet { message_type, body })
    }

    /// Decode a complete envelope held in memory; trailing bytes are rejected
    pub fn decode_slice(&self, bytes: &[u8], expected: MessageType) -> MeshResult<Payload> {
        let header: [u8; HEADER_LEN] = take(bytes, 0, HEADER_LEN)?
            .try_into()
            .map_err(|_| FramingError::Truncated { needed: HEADER_LEN })?;
        let (type_len, body_len) = split_header(&header);
        self.check_lengths(type_len, body_len)?;

        let mut offset = HEADER_LEN;
        let type_bytes = take(bytes, offset, type_len)?;
        let message_type = check_type(type_bytes, expected)?;
        offset += type_len;

        let body = take(bytes, offset, body_len)?;
        offset += body_len;

        let crc_bytes = take(bytes, offset, CRC_LEN)?;
        offset += CRC_LEN;
        let received = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        verify_checksum(received, checksum(&header, type_bytes, body))?;

        if offset != bytes.len() {
            return Err(FramingError::TrailingBytes {
                count: bytes.len() - offset,
            }
            .into());
        }

        Payload::from_body(message_type, body)
    }

    fn check_lengths(&self, type_len: usize, body_len: usize) -> Result<(), FramingError> {
        if body_len > self.limits.message_size_cap {
            return Err(FramingError::SizeLimit {
                field: "body",
                size: body_len,
                max: self.limits.message_size_cap,
            });
        }
        if type_len > self.limits.block_size_cap {
            return Err(FramingError::SizeLimit {
                field: "type",
                size: type_len,
                max: self.limits.block_size_cap,
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn header_bytes(type_len: usize, body_len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&(type_len as u32).to_be_bytes());
    header[4..].copy_from_slice(&(body_len as u32).to_be_bytes());
    header
}

fn split_header(header: &[u8; HEADER_LEN]) -> (usize, usize) {
    let type_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let body_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (type_len as usize, body_len as usize)
}

fn check_type(type_bytes: &[u8], expected: MessageType) -> Result<MessageType, FramingError> {
    let actual = TypeHeader::from_bytes(type_bytes)?.message_type;
    if actual != expected {
        return Err(FramingError::TypeMismatch { actual, expected });
    }
    Ok(actual)
}

/// CRC-32 (IEEE) over the size headers, type bytes and body
pub fn checksum(header: &[u8; HEADER_LEN], type_bytes: &[u8], body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(type_bytes);
    hasher.update(body);
    hasher.finalize()
}

// Plain u32 equality: no sign extension on either side.
fn verify_checksum(received: u32, computed: u32) -> Result<(), FramingError> {
    if received != computed {
        return Err(FramingError::Checksum {
            expected: received,
            actual: computed,
        });
    }
    Ok(())
}

fn take(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], FramingError> {
    let available = bytes.len().saturating_sub(offset);
    if available < len {
        return Err(FramingError::Truncated {
            needed: len - available,
        });
    }
    Ok(&bytes[offset..offset + len])
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MESSAGE_SIZE_CAP;
    use crate::protocol::chunked::chunk_channel;
    use crate::protocol::message::{AckPacket, AdvertisePacket, BlockSequencePacket, LuidPacket};
    use crate::types::Luid;
    use crate::MeshError;

    fn luid_payload() -> Payload {
        Payload::Luid(LuidPacket {
            luid: Luid::random(),
            hashed: None,
            protocol_version: 1,
        })
    }

    #[test]
    fn test_envelope_layout() {
        let codec = EnvelopeCodec::default();
        let envelope = codec.encode_raw(MessageType::Ack, &[0xAA, 0xBB]).unwrap();
        let bytes = envelope.as_bytes();

        assert_eq!(&bytes[0..4], &1u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_be_bytes());
        assert_eq!(bytes[8], MessageType::Ack.tag());
        assert_eq!(&bytes[9..11], &[0xAA, 0xBB]);

        let expected_crc = crc32fast::hash(&bytes[..11]);
        assert_eq!(&bytes[11..15], &expected_crc.to_be_bytes());
        assert_eq!(bytes.len(), 15);
    }

    #[test]
    fn test_slice_roundtrip() {
        let codec = EnvelopeCodec::default();
        let payload = luid_payload();
        let envelope = codec.encode(&payload).unwrap();
        let decoded = codec
            .decode_slice(envelope.as_bytes(), MessageType::Luid)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_encode_refuses_invalid_payload() {
        let codec = EnvelopeCodec::default();
        let invalid = Payload::Advertise(AdvertisePacket { provides: vec![] });
        assert!(codec.encode(&invalid).is_none());
        assert!(matches!(
            codec.try_encode(&invalid),
            Err(MeshError::Framing(FramingError::ValidationFailed {
                message_type: MessageType::Advertise
            }))
        ));
    }

    #[test]
    fn test_oversize_body_rejected_on_encode() {
        let codec = EnvelopeCodec::default();
        let body = vec![0u8; MESSAGE_SIZE_CAP + 1];
        let err = codec.encode_raw(MessageType::BlockSequence, &body).unwrap_err();
        assert!(matches!(
            err,
            MeshError::Framing(FramingError::SizeLimit { field: "body", size, max })
                if size == MESSAGE_SIZE_CAP + 1 && max == MESSAGE_SIZE_CAP
        ));

        // Exactly at the cap is fine
        let body = vec![0u8; MESSAGE_SIZE_CAP];
        assert!(codec.encode_raw(MessageType::BlockSequence, &body).is_ok());
    }

    #[test]
    fn test_oversize_body_rejected_on_decode() {
        let codec = EnvelopeCodec::default();
        let mut bytes = header_bytes(1, MESSAGE_SIZE_CAP + 1).to_vec();
        bytes.push(MessageType::Ack.tag());
        let err = codec.decode_slice(&bytes, MessageType::Ack).unwrap_err();
        assert!(matches!(
            err,
            MeshError::Framing(FramingError::SizeLimit { field: "body", .. })
        ));
    }

    #[test]
    fn test_oversize_type_rejected_independently() {
        let codec = EnvelopeCodec::default();
        let bytes = header_bytes(8193, 4);
        let err = codec.decode_slice(&bytes, MessageType::Ack).unwrap_err();
        assert!(matches!(
            err,
            MeshError::Framing(FramingError::SizeLimit { field: "type", max: 8192, .. })
        ));
    }

    #[test]
    fn test_type_mismatch_carries_both_tags() {
        let codec = EnvelopeCodec::default();
        let envelope = codec.encode(&luid_payload()).unwrap();
        let err = codec
            .decode_slice(envelope.as_bytes(), MessageType::Advertise)
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::Framing(FramingError::TypeMismatch {
                actual: MessageType::Luid,
                expected: MessageType::Advertise,
            })
        ));
    }

    #[test]
    fn test_corrupted_body_is_checksum_error() {
        let codec = EnvelopeCodec::default();
        let envelope = codec.encode(&luid_payload()).unwrap();
        let mut bytes = envelope.into_bytes();
        bytes[HEADER_LEN + 3] ^= 0x01;
        let err = codec.decode_slice(&bytes, MessageType::Luid).unwrap_err();
        assert!(err.is_checksum());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = EnvelopeCodec::default();
        let mut bytes = codec.encode(&luid_payload()).unwrap().into_bytes();
        bytes.push(0);
        assert!(matches!(
            codec.decode_slice(&bytes, MessageType::Luid),
            Err(MeshError::Framing(FramingError::TrailingBytes { count: 1 }))
        ));
    }

    #[test]
    fn test_fragments_cover_envelope() {
        let codec = EnvelopeCodec::default();
        let payload = Payload::BlockSequence(BlockSequencePacket {
            sequence: 7,
            data: vec![0x5A; 100],
            end: false,
        });
        let envelope = codec.encode(&payload).unwrap();
        let fragments: Vec<&[u8]> = envelope.fragments(20).unwrap().collect();

        assert!(fragments.iter().all(|f| f.len() <= 20 && !f.is_empty()));
        assert_eq!(fragments.len(), envelope.len().div_ceil(20));
        assert_eq!(fragments.concat(), envelope.as_bytes());
        assert!(envelope.fragments(0).is_err());
    }

    #[tokio::test]
    async fn test_decode_from_chunk_reader() {
        let codec = EnvelopeCodec::default();
        let payload = Payload::Ack(AckPacket {
            success: true,
            message: Some("hello".into()),
            status: 200,
        });
        let envelope = codec.encode(&payload).unwrap();
        let (writer, mut reader) = chunk_channel(16);

        let bytes = envelope.into_bytes();
        let producer = tokio::spawn(async move {
            for chunk in bytes.chunks(5) {
                writer.write(chunk).await.unwrap();
            }
        });

        let decoded = codec.decode(&mut reader, MessageType::Ack).await.unwrap();
        producer.await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_type_mismatch_stops_before_body() {
        let codec = EnvelopeCodec::default();
        let envelope = codec.encode(&luid_payload()).unwrap();
        let bytes = envelope.as_bytes();
        // Only the header and the type byte are available
        let mut source: &[u8] = &bytes[..HEADER_LEN + TypeHeader::LEN];
        let err = codec.decode(&mut source, MessageType::Ack).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Framing(FramingError::TypeMismatch { .. })
        ));
    }
}
