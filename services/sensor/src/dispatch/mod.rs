//! Connection dispatch.
//!
//! This module provides:
//! - Listener abstraction and the TCP socket listener
//! - The address → decoy bindings registry
//! - Deadline-bounded and peekable stream wrappers
//! - Protocol resolution for shared ports
//! - The hub that drives all of the above per connection
//!
//! ## Architecture
//!
//! ```text
//! Listener -> accept loop -> channel -> Hub -> per-connection task
//!                                                 |
//!                       TimeoutStream -> Resolver (Registry, PeekedStream)
//!                                                 |
//!                                          Decoy handler
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use dispatch::{Hub, HubConfig, SharedRegistry, TcpSocketListener};
//!
//! let registry = Arc::new(SharedRegistry::new(registry));
//! let listener = TcpSocketListener::bind(registry.snapshot().addresses()).await?;
//! let hub = Arc::new(Hub::new(HubConfig::default(), registry));
//! hub.run(listener, shutdown_rx).await?;
//! ```

mod hub;
mod listener;
mod peek;
mod registry;
mod resolver;
mod service;
mod timeout;

pub use hub::{Hub, HubConfig, HubStats, HubStatsSnapshot};
pub use listener::{
    classify_accept_error, AcceptErrorClass, Accepted, Listener, TcpSocketListener,
    ACCEPT_ERROR_BACKOFF,
};
pub use peek::{PeekConfig, PeekedStream, DEFAULT_PEEK_BUFFER_SIZE, DEFAULT_PEEK_WINDOW};
pub use registry::{Binding, Registry, RegistryBuilder, SharedRegistry};
pub use resolver::{select_candidate, ProtocolResolver, Resolution};
pub use service::{
    BoxStream, DecoyService, DetectingServicer, Servicer, SessionContext, Stream,
};
pub use timeout::{TimeoutStream, DEFAULT_SESSION_TIMEOUT};
