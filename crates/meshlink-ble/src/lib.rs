//! Bluetooth Low Energy transport engine for MeshLink
//!
//! This crate turns a short-range radio into a connection-oriented mesh
//! transport: it serializes radio calls through a priority queue, maps peer
//! luids to live links, and runs the multi-stage handshake with each peer.
//!
//! ## Architecture
//!
//! - [`Radio`] - the seam every radio implements ([`MemoryRadio`] for tests
//!   and demos, [`BtleplugRadio`] for real adapters)
//! - [`OperationQueue`] - one radio operation at a time, by priority then FIFO
//! - [`NamedMutex`] - string-keyed async locks for per-peer mutual exclusion
//! - [`ConnectionStateMachine`] - connection cache, active set, transaction
//!   locks and the server role
//! - [`PeerSession`] - framed message I/O over one link
//! - [`ProfileExchange`] - the stock [`TransactionHandler`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlink_ble::{
//!     ConnectionStateMachine, LocalProfile, MemoryRadio, OperationQueue, ProfileExchange,
//!     Schedulers,
//! };
//! use meshlink_core::{Luid, MeshConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (radio, peer) = MemoryRadio::pair();
//! let config = MeshConfig::default();
//! let schedulers = Schedulers::current()?;
//! let queue = OperationQueue::start(&schedulers, &config);
//! let machine = ConnectionStateMachine::new(Arc::new(radio), queue, schedulers, config);
//!
//! let mut handshake = ProfileExchange::new(LocalProfile::new(Luid::random()));
//! let outcome = machine
//!     .run_transaction(&peer.device(), Luid::random(), false, &mut handshake)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod btleplug_radio;
mod discovery;
mod error;
mod events;
mod exchange;
mod memory;
mod named_mutex;
mod peer;
mod queue;
mod radio;
mod session;
mod state;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use btleplug_radio::BtleplugRadio;
pub use discovery::{
    decode_luid, luid_service_data, Advertisement, LuidRotation, LUID_SERVICE_UUID,
    RX_CHARACTERISTIC_UUID, SERVICE_UUID, TX_CHARACTERISTIC_UUID,
};
pub use error::BleError;
pub use events::{EventHub, LinkEvent, ReplayHub, ReplaySubscription};
pub use exchange::{LocalProfile, PeerProfile, ProfileExchange, PROTOCOL_VERSION};
pub use memory::{
    MemoryDevice, MemoryLink, MemoryNetwork, MemoryRadio, RadioCommand, DEFAULT_MEMORY_MTU,
};
pub use named_mutex::{NamedGuard, NamedMutex};
pub use peer::PeerLink;
pub use queue::{
    operation, FnOperation, Operation, OperationContext, OperationHandle, OperationQueue,
    QueueStats, ReleaseGuard, ReleaseWaiter,
};
pub use radio::{fragment_size_for_mtu, Radio, Schedulers, ATT_HEADER_LEN};
pub use session::{Inbound, PeerSession, TransactionHandler};
pub use state::{ConnectionStateMachine, TransactionOutcome};
