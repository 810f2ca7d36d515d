//! Error types for the sensor.

use std::io;

use kushtaka_networking::AddressError;
use thiserror::Error;

/// Configuration errors. All of them abort start-up.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A port string failed to parse.
    #[error("invalid port string {input}: {source}")]
    Address {
        input: String,
        #[source]
        source: AddressError,
    },

    /// A port entry names a decoy that does not exist.
    #[error("unknown service '{service}' for port {port}")]
    UnknownService { service: String, port: String },

    /// A port entry ends up with no usable services.
    #[error("port {0} has no valid services, it won't be listened on")]
    NoServices(String),

    /// A port entry defines neither `port` nor `ports`.
    #[error("neither \"port\" nor \"ports\" were defined")]
    MissingPort,

    /// Two definitions would serve the same connections.
    #[error("port {address} conflicts with already defined port {existing}")]
    Conflict { address: String, existing: String },
}

impl ConfigError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::Address { .. } => "invalid_address",
            ConfigError::UnknownService { .. } => "unknown_service",
            ConfigError::NoServices(_) => "no_services",
            ConfigError::MissingPort => "missing_port",
            ConfigError::Conflict { .. } => "conflicting_port",
        }
    }
}

/// Per-connection resolution failures. These close the connection and
/// nothing else.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Nothing is bound to the connection's local address.
    #[error("no service configured for {address}")]
    NoService { address: String },

    /// Several services are bound and none claimed the connection.
    #[error("no suitable service for {address} among {candidates} candidates")]
    NoSuitableService { address: String, candidates: usize },

    /// Reading the first bytes failed or hit the session deadline.
    #[error("could not peek bytes: {0}")]
    Peek(#[source] io::Error),
}

impl ResolveError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ResolveError::NoService { .. } => "no_service",
            ResolveError::NoSuitableService { .. } => "no_suitable_service",
            ResolveError::Peek(_) => "peek_failed",
        }
    }
}

/// Errors that stop the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// The listener failed to start.
    #[error("listener failed to start: {0}")]
    ListenerStart(#[source] io::Error),

    /// The listener returned an accept error classified as fatal.
    #[error("fatal accept error: {0}")]
    Listener(#[source] io::Error),
}

impl HubError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            HubError::ListenerStart(_) => "listener_start_failed",
            HubError::Listener(_) => "listener_failed",
        }
    }
}
