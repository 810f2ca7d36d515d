//! Networking primitives for the sensor.
//!
//! This library provides:
//! - The `<protocol>/(<host>:)<port>` address grammar used by port bindings
//! - Resolved [`Address`] values with a wildcard-aware routing match
//!
//! ## Address Format
//!
//! ```text
//! tcp/2222              any local interface, port 2222
//! tcp/127.0.0.1:2222    only 127.0.0.1
//! udp/[::1]:53          bracketed IPv6 literal
//! tcp/localhost:2222    hostname, resolved once at parse time
//! ```
//!
//! An omitted host, an empty host and an unspecified IP (`0.0.0.0`, `::`) all
//! parse to the wildcard host.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

/// Address parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Input is not exactly `<protocol>/<rest>`.
    #[error("wrong format (needs to be \"protocol/(host:)port\"): {0}")]
    Malformed(String),

    /// Protocol token is neither `tcp` nor `udp`.
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    /// Port is not a number in 0..=65535.
    #[error("error parsing port value: {0}")]
    InvalidPort(String),

    /// Hostname could not be resolved to an IP address.
    #[error("could not resolve host {host}: {detail}")]
    Unresolvable { host: String, detail: String },
}

// ============================================================================
// Protocol
// ============================================================================

/// Transport protocol family of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Lowercase token as it appears in address strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(AddressError::UnknownProtocol(other.to_string())),
        }
    }
}

// ============================================================================
// Address
// ============================================================================

/// A resolved network address.
///
/// `host == None` is the wildcard: it stands for every local interface.
/// Derived equality is structural; use [`Address::matches`] for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub protocol: Protocol,
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl Address {
    /// Create an address, folding unspecified IPs into the wildcard.
    pub fn new(protocol: Protocol, host: Option<IpAddr>, port: u16) -> Self {
        Self {
            protocol,
            host: host.filter(|ip| !ip.is_unspecified()),
            port,
        }
    }

    /// Wildcard-host address.
    pub fn any(protocol: Protocol, port: u16) -> Self {
        Self::new(protocol, None, port)
    }

    /// Address of an accepted socket, as seen from the local side.
    pub fn from_socket(protocol: Protocol, local: SocketAddr) -> Self {
        Self::new(protocol, Some(local.ip()), local.port())
    }

    /// Routing equality.
    ///
    /// Protocols and ports must be equal. Hosts must be equal unless either
    /// side is the wildcard.
    pub fn matches(&self, other: &Address) -> bool {
        if self.protocol != other.protocol || self.port != other.port {
            return false;
        }

        match (self.host, other.host) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Socket address to bind for this address. The wildcard binds `0.0.0.0`.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .host
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            None => write!(f, "{}/{}", self.protocol, self.port),
            Some(IpAddr::V4(ip)) => write!(f, "{}/{}:{}", self.protocol, ip, self.port),
            Some(IpAddr::V6(ip)) => write!(f, "{}/[{}]:{}", self.protocol, ip, self.port),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s)
    }
}

/// Parse a `<protocol>/(<host>:)<port>` string into a resolved address.
///
/// Hostnames are resolved synchronously. Call this off async worker threads
/// (e.g. via `spawn_blocking`) when the input may contain one.
pub fn parse_address(input: &str) -> Result<Address, AddressError> {
    let parts: Vec<&str> = input.split('/').collect();
    let [proto, rest] = parts.as_slice() else {
        return Err(AddressError::Malformed(input.to_string()));
    };

    let (host, port) = split_host_port(rest);
    let port: u16 = port
        .parse()
        .map_err(|e: std::num::ParseIntError| AddressError::InvalidPort(format!("{port}: {e}")))?;

    let protocol: Protocol = proto.parse()?;

    let host = match host {
        None | Some("") => None,
        Some(h) => Some(resolve_host(h, port)?),
    };

    Ok(Address::new(protocol, host, port))
}

/// Split `host:port`, `[v6]:port` or a bare `port`.
fn split_host_port(s: &str) -> (Option<&str>, &str) {
    if let Some(inner) = s.strip_prefix('[') {
        if let Some((host, port)) = inner.split_once("]:") {
            return (Some(host), port);
        }
        return (None, s);
    }

    match s.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal, which is not a
        // valid host:port form.
        Some((host, port)) if !host.contains(':') => (Some(host), port),
        _ => (None, s),
    }
}

/// Literal IPs parse directly; anything else goes through the blocking
/// system resolver.
fn resolve_host(host: &str, port: u16) -> Result<IpAddr, AddressError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let unresolvable = |detail: String| AddressError::Unresolvable {
        host: host.to_string(),
        detail,
    };

    (host, port)
        .to_socket_addrs()
        .map_err(|e| unresolvable(e.to_string()))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| unresolvable("no addresses returned".to_string()))
}
