//! Deadline-bounded stream wrapper.
//!
//! The deadline is absolute and fixed when the stream is wrapped. Every read,
//! write, flush and shutdown after it has passed fails with
//! `io::ErrorKind::TimedOut`, including operations that would otherwise be
//! ready immediately.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Default session deadline.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// A stream whose I/O is bounded by an absolute deadline.
pub struct TimeoutStream<S> {
    inner: S,
    deadline: Instant,
    sleep: Pin<Box<Sleep>>,
}

impl<S> TimeoutStream<S> {
    /// Wrap `inner` with a deadline `timeout` from now.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self::with_deadline(inner, Instant::now() + timeout)
    }

    /// Wrap `inner` with an explicit deadline.
    pub fn with_deadline(inner: S, deadline: Instant) -> Self {
        Self {
            inner,
            deadline,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Registers the waker with the deadline timer and reports expiry.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(timed_out()),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "session deadline exceeded")
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
