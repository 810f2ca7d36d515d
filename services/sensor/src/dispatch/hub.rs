//! Dispatch hub.
//!
//! The hub drains connections from a [`Listener`] and runs each one in its
//! own task:
//!
//! ```text
//! Accepted -> Resolving -> Matched -> Handling -> Closed
//!                       \-> Unmatched ----------> Closed
//! ```
//!
//! Acceptance runs in a separate task feeding an unbounded channel, so a
//! slow session never delays the next accept. Shutdown stops intake and
//! preempts running sessions; every session is also preempted at its
//! deadline.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kushtaka_networking::Address;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::listener::{classify_accept_error, AcceptErrorClass, Accepted, Listener, ACCEPT_ERROR_BACKOFF};
use super::peek::PeekConfig;
use super::registry::SharedRegistry;
use super::resolver::ProtocolResolver;
use super::service::{wait_for_shutdown, SessionContext};
use super::timeout::{TimeoutStream, DEFAULT_SESSION_TIMEOUT};
use crate::error::{HubError, ResolveError};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Sensor name reported to decoys and logs.
    pub sensor_name: String,
    /// Deadline for each session, from accept to close.
    pub session_timeout: Duration,
    /// Peek settings for shared ports.
    pub peek: PeekConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sensor_name: "unknown".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            peek: PeekConfig::default(),
        }
    }
}

/// Hub counters.
#[derive(Debug, Default)]
pub struct HubStats {
    /// Connections received from the listener.
    pub connections_accepted: AtomicU64,
    /// Connections currently being resolved or handled.
    pub connections_active: AtomicU64,
    /// Connections closed, whatever the outcome.
    pub connections_closed: AtomicU64,
    /// Connections handed to a decoy.
    pub sessions_matched: AtomicU64,
    /// Connections on an address with no bindings.
    pub no_service: AtomicU64,
    /// Connections no candidate claimed.
    pub no_suitable_service: AtomicU64,
    /// Peek reads that failed or hit the deadline.
    pub peek_failed: AtomicU64,
    /// Decoy handlers that returned an error.
    pub handler_errors: AtomicU64,
    /// Sessions preempted at their deadline.
    pub sessions_timed_out: AtomicU64,
    /// Sessions preempted by shutdown.
    pub sessions_cancelled: AtomicU64,
    /// Transient accept errors survived.
    pub accept_errors: AtomicU64,
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub sessions_matched: u64,
    pub no_service: u64,
    pub no_suitable_service: u64,
    pub peek_failed: u64,
    pub handler_errors: u64,
    pub sessions_timed_out: u64,
    pub sessions_cancelled: u64,
    pub accept_errors: u64,
}

impl HubStats {
    pub fn snapshot(&self) -> HubStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HubStatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_active: load(&self.connections_active),
            connections_closed: load(&self.connections_closed),
            sessions_matched: load(&self.sessions_matched),
            no_service: load(&self.no_service),
            no_suitable_service: load(&self.no_suitable_service),
            peek_failed: load(&self.peek_failed),
            handler_errors: load(&self.handler_errors),
            sessions_timed_out: load(&self.sessions_timed_out),
            sessions_cancelled: load(&self.sessions_cancelled),
            accept_errors: load(&self.accept_errors),
        }
    }
}

/// Counts a connection as active until dropped, even if its handler panics.
struct ActiveConnection(Arc<HubStats>);

impl ActiveConnection {
    fn new(stats: Arc<HubStats>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.0.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// The connection dispatch hub.
pub struct Hub {
    config: HubConfig,
    registry: Arc<SharedRegistry>,
    resolver: ProtocolResolver,
    stats: Arc<HubStats>,
}

impl Hub {
    pub fn new(config: HubConfig, registry: Arc<SharedRegistry>) -> Self {
        Self {
            resolver: ProtocolResolver::new(config.peek.clone()),
            config,
            registry,
            stats: Arc::new(HubStats::default()),
        }
    }

    /// Get hub statistics.
    pub fn stats(&self) -> Arc<HubStats> {
        Arc::clone(&self.stats)
    }

    /// Start `listener` and dispatch its connections until shutdown.
    ///
    /// Returns `Ok(())` once `shutdown` flips to `true`, or an error when the
    /// listener fails to start or reports a fatal accept error. Sessions
    /// already running are not awaited.
    pub async fn run<L: Listener + 'static>(
        self: Arc<Self>,
        mut listener: L,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), HubError> {
        listener
            .start(shutdown.clone())
            .await
            .map_err(HubError::ListenerStart)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            tx,
            shutdown.clone(),
            Arc::clone(&self.stats),
        ));

        info!(sensor = %self.config.sensor_name, "Dispatch hub started");

        let mut intake_shutdown = shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut intake_shutdown) => {
                    info!("Shutdown signaled, no longer dispatching connections");
                    break;
                }
                next = rx.recv() => match next {
                    Some(accepted) => {
                        let span = tracing::info_span!(
                            "connection",
                            peer = %accepted.peer_addr,
                            local = %accepted.local_addr,
                        );
                        let hub = Arc::clone(&self);
                        tokio::spawn(hub.dispatch(accepted, shutdown.clone()).instrument(span));
                    }
                    // Accept loop finished; its result says why.
                    None => break,
                }
            }
        }

        match accept_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HubError::Listener(e)),
            Err(e) => Err(HubError::Listener(io::Error::other(e.to_string()))),
        }
    }

    /// Resolve and serve one connection.
    async fn dispatch(self: Arc<Self>, accepted: Accepted, shutdown: watch::Receiver<bool>) {
        let _active = ActiveConnection::new(Arc::clone(&self.stats));
        self.serve(accepted, shutdown).await;
    }

    async fn serve(&self, accepted: Accepted, shutdown: watch::Receiver<bool>) {
        let Accepted {
            stream,
            protocol,
            local_addr,
            peer_addr,
        } = accepted;

        let deadline = Instant::now() + self.config.session_timeout;
        let stream = TimeoutStream::with_deadline(stream, deadline);
        let address = Address::from_socket(protocol, local_addr);
        let registry = self.registry.snapshot();

        let resolution = match self.resolver.resolve(&registry, &address, stream).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.record_resolve_error(&e);
                debug!(
                    address = %address,
                    reason = e.reason_code(),
                    error = %e,
                    "No suitable handler"
                );
                return;
            }
        };

        let binding = resolution.binding;
        self.stats.sessions_matched.fetch_add(1, Ordering::Relaxed);
        debug!(
            sensor = %binding.sensor_name,
            service_type = %binding.service_type,
            port = binding.port,
            peeked = ?resolution.peeked,
            "Handling connection"
        );

        let ctx = SessionContext {
            sensor_name: binding.sensor_name.clone(),
            peer_addr,
            local_addr,
            deadline,
            shutdown,
        };
        let mut session_token = ctx.clone();

        tokio::select! {
            result = binding.service.handle(ctx, resolution.stream) => match result {
                Ok(()) => debug!(service_type = %binding.service_type, "Session closed"),
                Err(e) => {
                    self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        sensor = %binding.sensor_name,
                        service_type = %binding.service_type,
                        port = binding.port,
                        error = %e,
                        "Error handling service"
                    );
                }
            },
            _ = session_token.cancelled() => {
                if session_token.is_shutdown() {
                    self.stats.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
                    debug!(service_type = %binding.service_type, "Session cancelled by shutdown");
                } else {
                    self.stats.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        sensor = %binding.sensor_name,
                        service_type = %binding.service_type,
                        port = binding.port,
                        "Session deadline exceeded"
                    );
                }
            }
        }
    }

    fn record_resolve_error(&self, err: &ResolveError) {
        let counter = match err {
            ResolveError::NoService { .. } => &self.stats.no_service,
            ResolveError::NoSuitableService { .. } => &self.stats.no_suitable_service,
            ResolveError::Peek(_) => &self.stats.peek_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pull connections off the listener until shutdown or a fatal error.
async fn accept_loop<L: Listener>(
    mut listener: L,
    tx: mpsc::UnboundedSender<Accepted>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<HubStats>,
) -> io::Result<()> {
    loop {
        let result = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            result = listener.accept() => result,
        };

        match result {
            Ok(accepted) => {
                stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                if tx.send(accepted).is_err() {
                    return Ok(());
                }
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptErrorClass::Transient => {
                    stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Transient accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                AcceptErrorClass::Fatal => {
                    error!(error = %e, "Fatal accept error, stopping sensor");
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.peek.buffer_size, 1024);
        assert_eq!(config.sensor_name, "unknown");
    }

    #[test]
    fn test_active_connection_guard() {
        let stats = Arc::new(HubStats::default());
        let guard = ActiveConnection::new(Arc::clone(&stats));
        assert_eq!(stats.snapshot().connections_active, 1);

        drop(guard);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_active, 0);
        assert_eq!(snapshot.connections_closed, 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = HubStats::default();
        stats.connections_accepted.fetch_add(2, Ordering::Relaxed);
        stats.no_service.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.no_service, 1);
        assert_eq!(snapshot.handler_errors, 0);
    }
}
