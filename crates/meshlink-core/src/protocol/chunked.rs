//! Chunk reassembly for MTU-bounded inbound streams
//!
//! The radio delivers inbound bytes as variably sized chunks. A
//! `ChunkWriter`/`ChunkReader` pair turns them back into a byte stream the
//! codec can pull exact lengths from. The buffer is bounded: a writer that
//! would overflow it waits until the reader drains, so no data is ever dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::errors::{FramingError, TransportError};
use crate::{MeshError, MeshResult};

// ----------------------------------------------------------------------------
// Byte Source
// ----------------------------------------------------------------------------

/// A pull-based source of bytes the envelope decoder reads from
#[async_trait]
pub trait ByteSource: Send {
    /// Fill `buf` completely or fail
    async fn read_exact(&mut self, buf: &mut [u8]) -> MeshResult<()>;
}

#[async_trait]
impl<'a> ByteSource for &'a [u8] {
    async fn read_exact(&mut self, buf: &mut [u8]) -> MeshResult<()> {
        if self.len() < buf.len() {
            return Err(FramingError::Truncated {
                needed: buf.len() - self.len(),
            }
            .into());
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Chunk Channel
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChunkState {
    buffer: VecDeque<u8>,
    closed: bool,
    failure: Option<String>,
    reader_dropped: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ChunkState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChunkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bounded chunk pipe holding at most `capacity` buffered bytes
pub fn chunk_channel(capacity: usize) -> (ChunkWriter, ChunkReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(ChunkState::default()),
        capacity: capacity.max(1),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        ChunkWriter {
            shared: shared.clone(),
        },
        ChunkReader { shared },
    )
}

/// Producer half, fed by the radio's inbound notifications
#[derive(Debug)]
pub struct ChunkWriter {
    shared: Arc<Shared>,
}

impl ChunkWriter {
    /// Append a chunk, waiting for buffer space as needed
    pub async fn write(&self, chunk: &[u8]) -> MeshResult<()> {
        let mut rest = chunk;
        while !rest.is_empty() {
            {
                let mut state = self.shared.lock();
                if state.reader_dropped || state.closed {
                    return Err(TransportError::StreamClosed.into());
                }
                let space = self.shared.capacity - state.buffer.len();
                if space > 0 {
                    let n = space.min(rest.len());
                    state.buffer.extend(&rest[..n]);
                    rest = &rest[n..];
                    self.shared.readable.notify_one();
                    continue;
                }
            }
            self.shared.writable.notified().await;
        }
        Ok(())
    }

    /// Signal end-of-stream; buffered bytes remain readable
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.readable.notify_one();
    }

    /// Signal that the source failed; readers see the reason once drained
    pub fn fail<T: Into<String>>(&self, reason: T) {
        {
            let mut state = self.shared.lock();
            state.failure = Some(reason.into());
            state.closed = true;
        }
        self.shared.readable.notify_one();
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half, read by the envelope decoder
#[derive(Debug)]
pub struct ChunkReader {
    shared: Arc<Shared>,
}

impl ChunkReader {
    /// Whether the writer closed and every buffered byte was consumed
    pub fn is_finished(&self) -> bool {
        let state = self.shared.lock();
        state.closed && state.buffer.is_empty()
    }
}

#[async_trait]
impl ByteSource for ChunkReader {
    async fn read_exact(&mut self, buf: &mut [u8]) -> MeshResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            {
                let mut state = self.shared.lock();
                if !state.buffer.is_empty() {
                    let n = (buf.len() - filled).min(state.buffer.len());
                    for (dst, src) in buf[filled..filled + n]
                        .iter_mut()
                        .zip(state.buffer.drain(..n))
                    {
                        *dst = src;
                    }
                    filled += n;
                    self.shared.writable.notify_one();
                    continue;
                }
                if let Some(reason) = &state.failure {
                    return Err(MeshError::radio(reason.clone()));
                }
                if state.closed {
                    return Err(FramingError::Truncated {
                        needed: buf.len() - filled,
                    }
                    .into());
                }
            }
            self.shared.readable.notified().await;
        }
        Ok(())
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        self.shared.lock().reader_dropped = true;
        self.shared.writable.notify_one();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
