//! Non-destructive read-ahead.
//!
//! [`PeekedStream`] captures the first bytes of a connection with a single
//! read and replays them, in order and exactly once, before anything read
//! from the underlying stream afterwards. Writes pass straight through.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;

/// Default size of the peek buffer.
pub const DEFAULT_PEEK_BUFFER_SIZE: usize = 1024;

/// Default time to wait for the client to send its first bytes.
pub const DEFAULT_PEEK_WINDOW: Duration = Duration::from_secs(1);

/// Peek configuration.
#[derive(Debug, Clone)]
pub struct PeekConfig {
    /// Maximum bytes captured by the peek.
    pub buffer_size: usize,
    /// How long the peek waits for a client that has not spoken yet.
    pub window: Duration,
}

impl Default for PeekConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_PEEK_BUFFER_SIZE,
            window: DEFAULT_PEEK_WINDOW,
        }
    }
}

/// A stream with a replayable prefix.
pub struct PeekedStream<S> {
    inner: S,
    buffer: Vec<u8>,
    cursor: usize,
}

impl<S: AsyncRead + Unpin> PeekedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            cursor: 0,
        }
    }

    /// Capture up to `config.buffer_size` bytes with one read.
    ///
    /// Returns whatever the first read produced: possibly fewer bytes than
    /// the buffer holds, or none if the peer closed or stayed silent for the
    /// whole window. Errors from the underlying stream (including its own
    /// deadline) are returned as-is.
    pub async fn peek(&mut self, config: &PeekConfig) -> io::Result<&[u8]> {
        let mut buf = vec![0u8; config.buffer_size];
        let n = match timeout(config.window, self.inner.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => 0,
        };
        buf.truncate(n);

        // Anything not yet replayed stays in front of the new capture.
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        self.buffer.extend_from_slice(&buf);

        Ok(&self.buffer)
    }
}

impl<S> PeekedStream<S> {
    /// Bytes captured but not yet replayed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.cursor < this.buffer.len() {
            let pending = &this.buffer[this.cursor..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            this.cursor += n;
            if this.cursor == this.buffer.len() {
                this.buffer = Vec::new();
                this.cursor = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
