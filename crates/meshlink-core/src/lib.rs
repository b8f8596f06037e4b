//! MeshLink Core
//!
//! Foundational types for the MeshLink BLE mesh transport: the envelope codec
//! that frames every message on a link, chunk reassembly for MTU-bounded
//! inbound streams, the transaction result accumulator used by multi-step
//! handshakes, and the shared configuration and error types.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod protocol;
pub mod transaction;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{Limits, MeshConfig, BLOCK_SIZE_CAP, DEFAULT_FRAGMENT_SIZE, MESSAGE_SIZE_CAP};
pub use errors::{FramingError, MeshError, MeshResult, Result, TransactionError, TransportError};
pub use protocol::{Envelope, EnvelopeCodec, MessageType, Payload};
pub use transaction::{HandshakeStage, Stage, TransactionResult};
pub use types::{Luid, Priority};
