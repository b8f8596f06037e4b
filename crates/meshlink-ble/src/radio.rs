//! Radio abstraction
//!
//! Every hardware call the engine makes goes through the [`Radio`] trait, and
//! every call site reaches it through the operation queue. Implementations:
//! [`crate::BtleplugRadio`] for real adapters and [`crate::MemoryRadio`] for
//! deterministic loopback.

use core::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use meshlink_core::{MeshError, MeshResult};
use tokio::runtime::Handle;

// ----------------------------------------------------------------------------
// Radio Trait
// ----------------------------------------------------------------------------

/// A short-range radio able to open links to nearby devices
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Something discovered by scanning that can be connected to
    type Device: Clone + fmt::Debug + Send + Sync + 'static;
    /// An established connection
    type Link: Clone + fmt::Debug + Send + Sync + 'static;

    /// Connect to `device`. With `reverse` set the peer initiated the
    /// connection and the radio adopts the inbound link instead of dialing.
    async fn connect(&self, device: &Self::Device, reverse: bool) -> MeshResult<Self::Link>;

    async fn disconnect(&self, link: &Self::Link) -> MeshResult<()>;

    /// Write one MTU-bounded chunk
    async fn write(&self, link: &Self::Link, chunk: &[u8]) -> MeshResult<()>;

    /// Inbound MTU-bounded chunks, ending when the link closes
    async fn subscribe(&self, link: &Self::Link) -> MeshResult<BoxStream<'static, Vec<u8>>>;

    /// Negotiate the ATT MTU, returning the value granted
    async fn request_mtu(&self, link: &Self::Link, mtu: usize) -> MeshResult<usize>;

    /// Drop negotiated per-connection parameters once no peer is connected
    async fn reset_link_parameters(&self) -> MeshResult<()>;

    async fn start_server(&self) -> MeshResult<()>;

    async fn stop_server(&self) -> MeshResult<()>;
}

/// ATT header bytes subtracted from the MTU to get the usable payload
pub const ATT_HEADER_LEN: usize = 3;

/// Usable write payload for a negotiated MTU
pub fn fragment_size_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_HEADER_LEN).max(1)
}

// ----------------------------------------------------------------------------
// Schedulers
// ----------------------------------------------------------------------------

/// Runtime handles, one per concern.
///
/// `client` runs outbound radio calls, `server` runs inbound link pumps and
/// `io` runs the operation queue. Passing them explicitly keeps the engine
/// free of global executors.
#[derive(Debug, Clone)]
pub struct Schedulers {
    pub client: Handle,
    pub server: Handle,
    pub io: Handle,
}

impl Schedulers {
    pub fn new(client: Handle, server: Handle, io: Handle) -> Self {
        Self { client, server, io }
    }

    /// Use the calling runtime for every concern
    pub fn current() -> MeshResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| MeshError::config_error(format!("no tokio runtime: {}", e)))?;
        Ok(Self::from_handle(handle))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            client: handle.clone(),
            server: handle.clone(),
            io: handle,
        }
    }
}
