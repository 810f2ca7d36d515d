//! Sensor configuration.
//!
//! Everything comes from environment variables. Port bindings are a JSON
//! list in `KUSHTAKA_PORTS`, each entry naming decoys from the
//! [`ServiceCatalogue`].

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use kushtaka_networking::parse_address;
use serde::Deserialize;
use tracing::{info, warn};

use crate::decoys::ServiceCatalogue;
use crate::dispatch::{Binding, HubConfig, PeekConfig, Registry};
use crate::error::ConfigError;

const DEFAULT_PORTS: &str = r#"[{"port":"tcp/2222","services":["telnet"]}]"#;

/// One port entry from `KUSHTAKA_PORTS`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortEntry {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<String>>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl PortEntry {
    /// All port strings of the entry, `ports` first.
    pub fn port_strings(&self) -> Result<Vec<String>, ConfigError> {
        match (&self.port, &self.ports) {
            (None, None) => Err(ConfigError::MissingPort),
            (Some(port), Some(ports)) => {
                warn!(
                    port = %port,
                    "Both \"port\" and \"ports\" were defined, this can be confusing"
                );
                let mut all = ports.clone();
                all.push(port.clone());
                Ok(all)
            }
            (Some(port), None) => Ok(vec![port.clone()]),
            (None, Some(ports)) => Ok(ports.clone()),
        }
    }
}

/// Sensor configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Name attached to every binding and log line.
    pub sensor_name: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Deadline for each session.
    pub session_timeout: Duration,

    /// Bytes captured when peeking a shared port.
    pub peek_buffer_bytes: usize,

    /// How long a peek waits for the client's first bytes.
    pub peek_window: Duration,

    /// Stats heartbeat period.
    pub heartbeat_interval: Duration,

    /// Port entries.
    pub ports: Vec<PortEntry>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sensor_name = var("KUSHTAKA_SENSOR_NAME").unwrap_or_else(|| "unknown".to_string());

        let log_level = var("KUSHTAKA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let session_timeout_secs: u64 = var("KUSHTAKA_SESSION_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("KUSHTAKA_SESSION_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(30);
        let session_timeout = Duration::from_secs(session_timeout_secs.max(1));

        let peek_buffer_bytes: usize = var("KUSHTAKA_PEEK_BUFFER_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("KUSHTAKA_PEEK_BUFFER_BYTES must be an integer.")?
            .unwrap_or(1024)
            .clamp(1, 65536);

        let peek_window_ms: u64 = var("KUSHTAKA_PEEK_WINDOW_MS")
            .map(|v| v.parse())
            .transpose()
            .context("KUSHTAKA_PEEK_WINDOW_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let peek_window = Duration::from_millis(peek_window_ms.max(10));

        let heartbeat_secs: u64 = var("KUSHTAKA_HEARTBEAT_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("KUSHTAKA_HEARTBEAT_SECS must be an integer (seconds).")?
            .unwrap_or(30);
        let heartbeat_interval = Duration::from_secs(heartbeat_secs.max(1));

        let ports_json = var("KUSHTAKA_PORTS").unwrap_or_else(|| DEFAULT_PORTS.to_string());
        let ports: Vec<PortEntry> = serde_json::from_str(&ports_json)
            .context("KUSHTAKA_PORTS must be a JSON list of port entries.")?;

        Ok(Self {
            sensor_name,
            log_level,
            session_timeout,
            peek_buffer_bytes,
            peek_window,
            heartbeat_interval,
            ports,
        })
    }

    /// Hub settings derived from this configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            sensor_name: self.sensor_name.clone(),
            session_timeout: self.session_timeout,
            peek: PeekConfig {
                buffer_size: self.peek_buffer_bytes,
                window: self.peek_window,
            },
        }
    }

    /// Build the dispatch registry on the blocking pool.
    ///
    /// Hostnames in port strings go through the system resolver, which
    /// blocks, so async callers use this rather than [`Config::build_registry`].
    pub async fn load_registry(&self, catalogue: ServiceCatalogue) -> Result<Registry> {
        let config = self.clone();
        tokio::task::spawn_blocking(move || config.build_registry(&catalogue))
            .await
            .context("registry build task failed")?
            .context("invalid port configuration")
    }

    /// Build the dispatch registry from the port entries.
    pub fn build_registry(&self, catalogue: &ServiceCatalogue) -> Result<Registry, ConfigError> {
        let mut builder = Registry::builder();
        let mut used = BTreeSet::new();

        for entry in &self.ports {
            let port_strings = entry.port_strings()?;
            if entry.services.is_empty() {
                warn!(ports = %port_strings.join(", "), "No services defined for port(s)");
            }

            for input in port_strings {
                let address = parse_address(&input).map_err(|source| ConfigError::Address {
                    input: input.clone(),
                    source,
                })?;

                let mut bindings = Vec::with_capacity(entry.services.len());
                for name in &entry.services {
                    let service = catalogue.get(name).ok_or_else(|| ConfigError::UnknownService {
                        service: name.clone(),
                        port: input.clone(),
                    })?;
                    used.insert(name.as_str());
                    bindings.push(Binding::new(
                        service.clone(),
                        self.sensor_name.as_str(),
                        name.as_str(),
                        address.port,
                    ));
                }

                if bindings.is_empty() {
                    return Err(ConfigError::NoServices(input));
                }

                builder.define(address, bindings)?;
                info!(
                    address = %address,
                    services = %entry.services.join(","),
                    "Configured port"
                );
            }
        }

        for name in catalogue.names().filter(|name| !used.contains(name)) {
            warn!(service = name, "Service is defined but not used");
        }

        Ok(builder.build())
    }
}
