//! Decoy service interface.
//!
//! A decoy is registered either as a detecting service, which can claim a
//! connection from its first bytes, or as an unconditional service, which
//! takes whatever reaches it. The choice is made explicitly when the binding
//! is built, never discovered at dispatch time.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;

/// Byte stream handed to listeners, resolvers and decoys.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Type-erased connection stream.
pub type BoxStream = Box<dyn Stream>;

/// Per-session context passed to a decoy handler.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Name of the sensor serving the connection.
    pub sensor_name: String,
    /// Remote peer.
    pub peer_addr: SocketAddr,
    /// Local address the connection arrived on.
    pub local_addr: SocketAddr,
    /// Absolute deadline for the whole session.
    pub deadline: Instant,
    /// Global shutdown signal (`true` once shutdown has begun).
    pub shutdown: watch::Receiver<bool>,
}

impl SessionContext {
    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once either the shutdown signal fires or the deadline passes.
    pub async fn cancelled(&mut self) {
        if self.is_shutdown() {
            return;
        }
        let deadline = self.deadline;
        tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

/// Wait until the watch flips to `true` or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender dropped: nobody can signal shutdown any more.
            std::future::pending::<()>().await;
        }
    }
}

/// A decoy session handler.
#[async_trait]
pub trait Servicer: Send + Sync {
    /// Serve one connection until the peer leaves, the session is cancelled,
    /// or the handler gives up.
    async fn handle(&self, ctx: SessionContext, stream: BoxStream) -> anyhow::Result<()>;
}

/// A decoy that can recognise its protocol from the first bytes of a
/// connection.
pub trait DetectingServicer: Servicer {
    /// Whether this decoy claims a connection that opened with `peeked`.
    ///
    /// `peeked` may be empty when the client has not spoken yet.
    fn can_handle(&self, peeked: &[u8]) -> bool;
}

/// A decoy service as registered in the dispatch registry.
#[derive(Clone)]
pub enum DecoyService {
    /// Participates in byte-based detection.
    Detecting(Arc<dyn DetectingServicer>),
    /// Matches any connection that reaches it.
    Unconditional(Arc<dyn Servicer>),
}

impl DecoyService {
    pub fn detecting<S: DetectingServicer + 'static>(service: S) -> Self {
        Self::Detecting(Arc::new(service))
    }

    pub fn unconditional<S: Servicer + 'static>(service: S) -> Self {
        Self::Unconditional(Arc::new(service))
    }

    pub fn is_detecting(&self) -> bool {
        matches!(self, Self::Detecting(_))
    }

    /// Run the session handler.
    pub async fn handle(&self, ctx: SessionContext, stream: BoxStream) -> anyhow::Result<()> {
        match self {
            Self::Detecting(s) => s.handle(ctx, stream).await,
            Self::Unconditional(s) => s.handle(ctx, stream).await,
        }
    }
}

impl fmt::Debug for DecoyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detecting(_) => f.write_str("DecoyService::Detecting"),
            Self::Unconditional(_) => f.write_str("DecoyService::Unconditional"),
        }
    }
}
