//! Write-side plumbing between the archive encoders and their consumer.
//!
//! Archive encoders speak [`AsyncWrite`]; the upload side wants a pull-based
//! chunk stream. [`ChunkSink`] is the in-memory buffer in the middle and
//! [`ChannelWriter`] pushes its chunks through a bounded channel, so a slow
//! consumer suspends the encoder instead of letting the buffer grow.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio_util::sync::PollSender;

/// Preferred size of emitted chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Depth of the encoder-to-consumer channel.
pub const CHANNEL_CAPACITY: usize = 4;

/// Write to a sink whose contents were already handed off.
#[derive(Error, Debug)]
#[error("sink is closed")]
pub struct StreamClosed;

impl From<StreamClosed> for io::Error {
    fn from(_: StreamClosed) -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "sink is closed")
    }
}

/// Append-only byte buffer with a single-consumer drain side.
///
/// `write` appends, `drain` takes everything accumulated so far in one move,
/// and `close` makes any further write fail with [`StreamClosed`]. Draining
/// leaves the sink empty but still writable.
#[derive(Debug, Default)]
pub struct ChunkSink {
    buf: BytesMut,
    closed: bool,
}

impl ChunkSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            closed: false,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, StreamClosed> {
        if self.closed {
            return Err(StreamClosed);
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Take everything buffered so far without copying.
    pub fn drain(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "bundle channel closed")
}

/// [`AsyncWrite`] adapter that buffers into a [`ChunkSink`] and emits
/// [`Bytes`] chunks of roughly `chunk_size` through a bounded channel.
///
/// Backpressure: a full channel parks the writer in `poll_reserve` until the
/// consumer catches up. A dropped receiver surfaces as `BrokenPipe`.
///
/// Shutdown only flushes. Encoders wrapping this writer propagate their own
/// shutdown to the inner writer, and the channel must survive that so later
/// members can still be written; the channel closes when the writer drops.
pub struct ChannelWriter {
    sender: PollSender<io::Result<Bytes>>,
    sink: ChunkSink,
    chunk_size: usize,
}

impl ChannelWriter {
    pub fn new(sender: PollSender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        Self {
            sender,
            sink: ChunkSink::with_capacity(chunk_size * 2),
            chunk_size,
        }
    }

    fn poll_emit_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        debug_assert!(!self.sink.is_empty());
        ready!(self.sender.poll_reserve(cx)).map_err(|_| channel_closed())?;
        let chunk = self.sink.drain();
        self.sender.send_item(Ok(chunk)).map_err(|_| channel_closed())?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.sink.len() >= self.chunk_size {
            ready!(self.as_mut().poll_emit_chunk(cx))?;
        }
        let take = buf.len().min(self.chunk_size - self.sink.len());
        let written = self.sink.write(&buf[..take])?;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.sink.is_empty() {
            ready!(self.as_mut().poll_emit_chunk(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// [`AsyncWrite`] wrapper counting every byte that passes through. The
/// archive encoders derive member offsets and sizes from this count.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
