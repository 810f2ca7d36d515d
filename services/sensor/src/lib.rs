pub mod config;
pub mod decoys;
pub mod dispatch;
pub mod error;
pub mod heartbeat;

pub use config::{Config, PortEntry};
pub use decoys::{HttpDecoy, ServiceCatalogue, SshDecoy, TelnetDecoy};
pub use dispatch::{
    Accepted, Binding, BoxStream, DecoyService, DetectingServicer, Hub, HubConfig, HubStats,
    Listener, Registry, Servicer, SessionContext, SharedRegistry, TcpSocketListener,
};
pub use error::{ConfigError, HubError, ResolveError};
