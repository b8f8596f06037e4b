//! Per-link message I/O
//!
//! A [`PeerSession`] frames outbound payloads with the envelope codec and
//! writes them one fragment per queued operation, so bytes on a link stay in
//! order. Each link subscribes once; its [`Inbound`] pump feeds a bounded
//! reassembly buffer that successive sessions on the link decode from.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use meshlink_core::errors::TransportError;
use meshlink_core::protocol::{chunk_channel, ChunkReader, MessageType, Payload};
use meshlink_core::{EnvelopeCodec, HandshakeStage, Luid, MeshConfig, MeshResult, TransactionResult};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::peer::PeerLink;
use crate::queue::{operation, OperationQueue};
use crate::radio::Radio;

// ----------------------------------------------------------------------------
// Transaction Handler
// ----------------------------------------------------------------------------

/// Drives one handshake over a session, one stage at a time.
///
/// Each call returns a partial result: usually just the next stage, with the
/// final call carrying the item and a terminal stage. A result without a
/// stage repeats the current one.
#[async_trait]
pub trait TransactionHandler<R: Radio>: Send {
    type Item: Send + 'static;

    async fn step(
        &mut self,
        session: &mut PeerSession<R>,
        stage: HandshakeStage,
    ) -> TransactionResult<Self::Item>;
}

// ----------------------------------------------------------------------------
// Inbound Stream
// ----------------------------------------------------------------------------

/// The single inbound subscription of a link.
///
/// A pump task copies radio chunks into a bounded reassembly buffer. The
/// reader is lent to one session at a time. Dropping the `Inbound` stops
/// the pump.
pub struct Inbound {
    reader: Arc<Mutex<ChunkReader>>,
    pump: JoinHandle<()>,
}

impl Inbound {
    /// Start pumping `stream` on `scheduler`
    pub fn spawn(
        mut stream: BoxStream<'static, Vec<u8>>,
        luid: Luid,
        capacity: usize,
        scheduler: &Handle,
    ) -> Self {
        let (writer, reader) = chunk_channel(capacity);
        let pump = scheduler.spawn(async move {
            while let Some(chunk) = stream.next().await {
                trace!("Received {} bytes from {}", chunk.len(), luid);
                if let Err(e) = writer.write(&chunk).await {
                    debug!("Dropping inbound stream for {}: {}", luid, e);
                    return;
                }
            }
            debug!("Inbound stream for {} ended", luid);
            writer.close();
        });
        Self {
            reader: Arc::new(Mutex::new(reader)),
            pump,
        }
    }

    pub(crate) async fn reader(&self) -> OwnedMutexGuard<ChunkReader> {
        self.reader.clone().lock_owned().await
    }

    /// Stop pumping; readers see the end of the stream
    pub fn close(&self) {
        self.pump.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.pump.is_finished()
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Peer Session
// ----------------------------------------------------------------------------

/// Framed message I/O over one peer link
pub struct PeerSession<R: Radio> {
    radio: Arc<R>,
    queue: OperationQueue,
    peer: PeerLink<R::Link>,
    codec: EnvelopeCodec,
    reader: OwnedMutexGuard<ChunkReader>,
}

impl<R: Radio> PeerSession<R> {
    /// Take the link's inbound reader for the lifetime of the session.
    ///
    /// Waits while another session on the same link holds it.
    pub async fn open(
        radio: Arc<R>,
        queue: OperationQueue,
        peer: PeerLink<R::Link>,
        config: &MeshConfig,
    ) -> MeshResult<Self> {
        let reader = peer
            .inbound_reader()
            .await
            .ok_or(TransportError::StreamClosed)?;
        Ok(Self {
            radio,
            queue,
            peer,
            codec: EnvelopeCodec::new(config.limits),
            reader,
        })
    }

    pub fn luid(&self) -> Luid {
        self.peer.luid()
    }

    pub fn peer(&self) -> &PeerLink<R::Link> {
        &self.peer
    }

    /// Encode `payload` and write it fragment by fragment
    pub async fn send(&self, payload: &Payload) -> MeshResult<()> {
        let envelope = self.codec.try_encode(payload)?;
        let handles: Vec<_> = envelope
            .fragments(self.peer.fragment_size())?
            .map(|fragment| {
                let radio = self.radio.clone();
                let link = self.peer.link().clone();
                let chunk = fragment.to_vec();
                self.queue.submit(operation("write", move |_ctx| async move {
                    radio.write(&link, &chunk).await
                }))
            })
            .collect();

        trace!(
            "Sending {} to {} in {} fragments",
            envelope.message_type(),
            self.peer.luid(),
            handles.len()
        );
        // Dropping the remaining handles on error cancels the unstarted writes
        for handle in handles {
            handle.result().await?;
        }
        Ok(())
    }

    /// Read the next envelope, which must be of type `expected`
    pub async fn receive(&mut self, expected: MessageType) -> MeshResult<Payload> {
        self.codec.decode(&mut *self.reader, expected).await
    }

    /// Send `payload` then wait for the peer's message of type `expected`
    pub async fn exchange(&mut self, payload: &Payload, expected: MessageType) -> MeshResult<Payload> {
        self.send(payload).await?;
        self.receive(expected).await
    }

}

impl<R: Radio> fmt::Debug for PeerSession<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .finish()
    }
}
