//! Listener collaborator and TCP socket listener.
//!
//! The hub never binds sockets itself. It drives a [`Listener`], which hands
//! over accepted byte streams together with the addresses they arrived on.
//! [`TcpSocketListener`] is the production implementation: one tokio
//! `TcpListener` per configured TCP address, multiplexed into one accept
//! stream.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use kushtaka_networking::{Address, Protocol};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::service::{wait_for_shutdown, BoxStream};

/// Pause after a transient accept error before accepting again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A connection handed over by a listener.
pub struct Accepted {
    pub stream: BoxStream,
    /// Transport the connection arrived over.
    pub protocol: Protocol,
    /// Local address the peer connected to.
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl Accepted {
    pub fn new(
        stream: BoxStream,
        protocol: Protocol,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            stream,
            protocol,
            local_addr,
            peer_addr,
        }
    }
}

/// Source of raw inbound connections.
#[async_trait]
pub trait Listener: Send {
    /// Begin listening. Called once, before the first `accept`.
    async fn start(&mut self, shutdown: watch::Receiver<bool>) -> io::Result<()>;

    /// Wait for the next connection.
    ///
    /// Must be cancel-safe: the hub races it against the shutdown signal.
    async fn accept(&mut self) -> io::Result<Accepted>;
}

/// How the hub reacts to an accept error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorClass {
    /// Log, back off briefly and keep accepting.
    Transient,
    /// Stop the sensor.
    Fatal,
}

/// Classify an accept error.
///
/// Per-connection failures, network errors reported for a pending
/// connection and resource exhaustion are transient; anything else means the
/// listener itself is unusable.
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorClass {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::NetworkDown
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable => AcceptErrorClass::Transient,
        _ if is_transient_os_error(err) => AcceptErrorClass::Transient,
        _ => AcceptErrorClass::Fatal,
    }
}

/// Errno values `accept(2)` reports for a single pending connection, plus
/// descriptor and memory exhaustion. `EPERM` comes from firewall rules.
#[cfg(unix)]
fn is_transient_os_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(
            libc::EMFILE
                | libc::ENFILE
                | libc::ENOBUFS
                | libc::ENOMEM
                | libc::EPROTO
                | libc::ENOPROTOOPT
                | libc::EHOSTDOWN
                | libc::EOPNOTSUPP
                | libc::EPERM
        )
    ) || is_no_network(err)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn is_no_network(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENONET)
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn is_no_network(_err: &io::Error) -> bool {
    false
}

#[cfg(not(unix))]
fn is_transient_os_error(_err: &io::Error) -> bool {
    false
}

/// TCP listener bound to every configured TCP address.
pub struct TcpSocketListener {
    sockets: Vec<TcpListener>,
    tx: mpsc::UnboundedSender<io::Result<Accepted>>,
    rx: mpsc::UnboundedReceiver<io::Result<Accepted>>,
}

impl TcpSocketListener {
    /// Bind one socket per TCP address. UDP addresses are skipped.
    pub async fn bind<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> io::Result<Self> {
        let mut sockets = Vec::new();

        for address in addresses {
            if address.protocol != Protocol::Tcp {
                warn!(address = %address, "UDP bindings are not served by the TCP listener");
                continue;
            }

            let socket = TcpListener::bind(address.bind_addr()).await?;
            info!(
                address = %address,
                bind_addr = %socket.local_addr()?,
                "Listener bound"
            );
            sockets.push(socket);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self { sockets, tx, rx })
    }

    /// Addresses actually bound (useful when binding port 0).
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.sockets.iter().map(|s| s.local_addr()).collect()
    }
}

#[async_trait]
impl Listener for TcpSocketListener {
    async fn start(&mut self, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        for socket in self.sockets.drain(..) {
            let tx = self.tx.clone();
            let mut shutdown = shutdown.clone();

            tokio::spawn(async move {
                let bind_addr = socket.local_addr().ok();
                loop {
                    let result = tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        result = socket.accept() => result,
                    };

                    let item = match result {
                        Ok((stream, peer_addr)) => match stream.local_addr() {
                            Ok(local_addr) => Ok(Accepted::new(
                                Box::new(stream),
                                Protocol::Tcp,
                                local_addr,
                                peer_addr,
                            )),
                            // The peer is already gone; drop just this connection.
                            Err(e) => {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Dropping connection without local address"
                                );
                                continue;
                            }
                        },
                        Err(e) => Err(e),
                    };

                    let failed = item.is_err();
                    if tx.send(item).is_err() {
                        break;
                    }
                    if failed {
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
                debug!(bind_addr = ?bind_addr, "Socket accept loop stopped");
            });
        }

        Ok(())
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        match self.rx.recv().await {
            Some(item) => item,
            // `self.tx` keeps the channel open, so this only happens on misuse.
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient_kinds() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
            io::ErrorKind::NetworkDown,
            io::ErrorKind::NetworkUnreachable,
            io::ErrorKind::HostUnreachable,
        ] {
            assert_eq!(
                classify_accept_error(&io::Error::from(kind)),
                AcceptErrorClass::Transient,
                "{kind:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_transient_os_errors() {
        for code in [
            libc::EMFILE,
            libc::ENFILE,
            libc::ENOBUFS,
            libc::ENOMEM,
            libc::EPROTO,
            libc::ENOPROTOOPT,
            libc::EHOSTDOWN,
            libc::EOPNOTSUPP,
            libc::EPERM,
            libc::ENETDOWN,
            libc::ENETUNREACH,
            libc::EHOSTUNREACH,
        ] {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(classify_accept_error(&err), AcceptErrorClass::Transient, "errno {code}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_classify_no_network_is_transient() {
        let err = io::Error::from_raw_os_error(libc::ENONET);
        assert_eq!(classify_accept_error(&err), AcceptErrorClass::Transient);
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_fatal_os_errors() {
        for code in [libc::EBADF, libc::EINVAL, libc::ENOTSOCK, libc::EACCES] {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(classify_accept_error(&err), AcceptErrorClass::Fatal, "errno {code}");
        }
    }

    #[test]
    fn test_classify_fatal() {
        for kind in [
            io::ErrorKind::NotConnected,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput,
        ] {
            assert_eq!(
                classify_accept_error(&io::Error::from(kind)),
                AcceptErrorClass::Fatal,
                "{kind:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_tcp_listener_accepts_on_bound_port() {
        let address: Address = "tcp/127.0.0.1:0".parse().unwrap();
        let mut listener = TcpSocketListener::bind([&address]).await.unwrap();
        let bound = listener.local_addrs().unwrap()[0];

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio_test::assert_ok!(listener.start(shutdown_rx).await);

        let client = tokio::net::TcpStream::connect(bound).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.protocol, Protocol::Tcp);
        assert_eq!(accepted.local_addr, bound);
        assert_eq!(accepted.peer_addr, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_addresses_are_skipped() {
        let address: Address = "udp/127.0.0.1:0".parse().unwrap();
        let listener = TcpSocketListener::bind([&address]).await.unwrap();
        assert!(listener.local_addrs().unwrap().is_empty());
    }
}
