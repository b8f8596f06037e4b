//! Error types for the MeshLink transport
//!
//! This module contains the framing, transport and transaction error types and
//! the `MeshError` type that unifies them. Lock conflicts are deliberately not
//! represented here: a busy peer is reported as a plain `false`.

use crate::protocol::MessageType;
use crate::types::Luid;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while framing or parsing an envelope.
///
/// All of these are fatal to the parse in progress; once a checksum error is
/// reported the underlying stream must be considered corrupted.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("{field} length {size} exceeds limit {max}")]
    SizeLimit {
        field: &'static str,
        size: usize,
        max: usize,
    },
    #[error("Message type mismatch: got {actual}, expected {expected}")]
    TypeMismatch {
        actual: MessageType,
        expected: MessageType,
    },
    #[error("Unknown message type tag: {tag}")]
    UnknownMessageType { tag: u8 },
    #[error("Checksum mismatch: received {expected:#010x}, computed {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("Stream ended before {needed} more bytes arrived")]
    Truncated { needed: usize },
    #[error("Envelope has {count} trailing bytes")]
    TrailingBytes { count: usize },
    #[error("Validation failed for {message_type} body")]
    ValidationFailed { message_type: MessageType },
    #[error("Invalid fragment size: {size}")]
    InvalidFragmentSize { size: usize },
    #[error("Malformed type header: {reason}")]
    MalformedTypeHeader { reason: String },
}

/// Errors raised by the radio or the operation queue.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Radio permission denied")]
    PermissionDenied,
    #[error("Peer {luid} disconnected mid-operation")]
    Disconnected { luid: Luid },
    #[error("Connection failed to peer {luid}: {reason}")]
    ConnectionFailed { luid: Luid, reason: String },
    #[error("Operation {operation} timed out after {duration_ms}ms")]
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Operation queue closed")]
    QueueClosed,
    #[error("Operation {operation} faulted: {reason}")]
    Fault {
        operation: &'static str,
        reason: String,
    },
    #[error("Inbound stream closed")]
    StreamClosed,
    #[error("Peer {luid} is not connected")]
    NotConnected { luid: Luid },
    #[error("Unsupported by this radio: {feature}")]
    Unsupported { feature: &'static str },
    #[error("Radio error: {reason}")]
    Radio { reason: String },
}

/// Errors raised while driving a multi-step transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Conflicting handshake stages: {left} vs {right}")]
    StageConflict { left: String, right: String },
    #[error("Transaction with {luid} timed out after {duration_ms}ms")]
    Timeout { luid: Luid, duration_ms: u64 },
    #[error("Handler failed: {reason}")]
    Handler { reason: String },
}

/// Core error type for MeshLink
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl MeshError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        MeshError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a radio error with a reason
    pub fn radio<T: Into<String>>(reason: T) -> Self {
        MeshError::Transport(TransportError::Radio {
            reason: reason.into(),
        })
    }

    /// Create a connection failed error
    pub fn connection_failed<R: Into<String>>(luid: Luid, reason: R) -> Self {
        MeshError::Transport(TransportError::ConnectionFailed {
            luid,
            reason: reason.into(),
        })
    }

    /// Create an operation timeout error
    pub fn timeout(operation: &'static str, duration: core::time::Duration) -> Self {
        MeshError::Transport(TransportError::Timeout {
            operation,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Whether this error is a timeout at either the operation or transaction level
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MeshError::Transport(TransportError::Timeout { .. })
                | MeshError::Transaction(TransactionError::Timeout { .. })
        )
    }

    /// Whether this error is a checksum failure
    pub fn is_checksum(&self) -> bool {
        matches!(self, MeshError::Framing(FramingError::Checksum { .. }))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MeshError>;
pub type MeshResult<T> = Result<T>;
