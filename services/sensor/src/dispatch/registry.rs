//! Dispatch registry.
//!
//! Maps resolved listen addresses to the ordered decoy bindings serving them.
//! The registry is assembled by [`RegistryBuilder`] at start-up and frozen
//! into an immutable [`Registry`]. Dispatch tasks read it through
//! [`SharedRegistry`], whose only mutation is a whole-structure swap.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kushtaka_networking::Address;
use tracing::{debug, info};

use super::service::DecoyService;
use crate::error::ConfigError;

/// A decoy service bound to an address, with its metadata.
#[derive(Debug, Clone)]
pub struct Binding {
    pub service: DecoyService,
    /// Sensor the binding belongs to.
    pub sensor_name: String,
    /// Decoy type, e.g. `telnet`.
    pub service_type: String,
    /// Port the binding was declared for.
    pub port: u16,
}

impl Binding {
    pub fn new(
        service: DecoyService,
        sensor_name: impl Into<String>,
        service_type: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service,
            sensor_name: sensor_name.into(),
            service_type: service_type.into(),
            port,
        }
    }

    fn same_identity(&self, other: &Binding) -> bool {
        self.service_type == other.service_type
            && self.sensor_name == other.sensor_name
            && self.port == other.port
    }
}

/// Immutable address → bindings table.
#[derive(Debug, Default)]
pub struct Registry {
    /// Entries in definition order. No two addresses overlap.
    entries: Vec<(Address, Vec<Binding>)>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Candidate bindings for a connection on `address`, in registration
    /// order. Empty when nothing is bound there.
    pub fn lookup(&self, address: &Address) -> &[Binding] {
        self.entries
            .iter()
            .find(|(registered, _)| registered.matches(address))
            .map(|(_, bindings)| bindings.as_slice())
            .unwrap_or(&[])
    }

    /// Defined addresses, in definition order.
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.entries.iter().map(|(address, _)| address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder enforcing the registry's no-overlap invariant.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<(Address, Vec<Binding>)>,
}

impl RegistryBuilder {
    /// Define a port entry with its full binding list.
    ///
    /// Fails if any already-defined address would match the same
    /// connections, including an exact redefinition.
    pub fn define(
        &mut self,
        address: Address,
        bindings: Vec<Binding>,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(existing) = self.overlapping(&address) {
            return Err(ConfigError::Conflict {
                address: address.to_string(),
                existing: existing.to_string(),
            });
        }

        self.entries.push((address, Vec::new()));
        for binding in bindings {
            self.register(address, binding)?;
        }
        Ok(self)
    }

    /// Append a binding to the entry for `address`.
    ///
    /// Registering a binding identical to one already there (same decoy
    /// type, sensor name and port) is a no-op. Registering at an address
    /// that overlaps a different defined address is a conflict.
    pub fn register(&mut self, address: Address, binding: Binding) -> Result<&mut Self, ConfigError> {
        let index = match self.entries.iter().position(|(a, _)| *a == address) {
            Some(index) => index,
            None => {
                if let Some(existing) = self.overlapping(&address) {
                    return Err(ConfigError::Conflict {
                        address: address.to_string(),
                        existing: existing.to_string(),
                    });
                }
                self.entries.push((address, Vec::new()));
                self.entries.len() - 1
            }
        };

        let bindings = &mut self.entries[index].1;
        if bindings.iter().any(|b| b.same_identity(&binding)) {
            debug!(
                address = %address,
                service_type = %binding.service_type,
                "Binding already registered"
            );
            return Ok(self);
        }

        bindings.push(binding);
        Ok(self)
    }

    fn overlapping(&self, address: &Address) -> Option<&Address> {
        self.entries
            .iter()
            .map(|(a, _)| a)
            .find(|a| a.matches(address))
    }

    /// Freeze the registry.
    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
        }
    }
}

/// Registry handle shared by all dispatch tasks.
///
/// Readers take a consistent snapshot without locking. A replacement is
/// published in a single pointer swap; tasks holding the old snapshot finish
/// with it.
pub struct SharedRegistry {
    current: ArcSwap<Registry>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: ArcSwap::from_pointee(registry),
        }
    }

    /// Current registry snapshot.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.current.load_full()
    }

    /// Atomically replace the whole registry.
    pub fn replace(&self, registry: Registry) {
        let address_count = registry.len();
        self.current.store(Arc::new(registry));
        info!(address_count = address_count, "Registry replaced atomically");
    }
}

impl From<Registry> for SharedRegistry {
    fn from(registry: Registry) -> Self {
        Self::new(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::service::{BoxStream, Servicer, SessionContext};
    use async_trait::async_trait;
    use kushtaka_networking::{parse_address, Protocol};

    struct Noop;

    #[async_trait]
    impl Servicer for Noop {
        async fn handle(&self, _ctx: SessionContext, _stream: BoxStream) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn binding(service_type: &str, port: u16) -> Binding {
        Binding::new(DecoyService::unconditional(Noop), "test", service_type, port)
    }

    fn addr(s: &str) -> Address {
        parse_address(s).unwrap()
    }

    fn types(bindings: &[Binding]) -> Vec<&str> {
        bindings.iter().map(|b| b.service_type.as_str()).collect()
    }

    #[test]
    fn test_lookup_returns_registered_bindings_in_order() {
        let mut builder = Registry::builder();
        builder
            .define(addr("tcp/2222"), vec![binding("ssh", 2222), binding("telnet", 2222)])
            .unwrap();
        builder.define(addr("tcp/8080"), vec![binding("http", 8080)]).unwrap();
        let registry = builder.build();

        assert_eq!(types(registry.lookup(&addr("tcp/2222"))), ["ssh", "telnet"]);
        assert_eq!(types(registry.lookup(&addr("tcp/8080"))), ["http"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_is_unaffected_by_unrelated_registrations() {
        let mut builder = Registry::builder();
        builder.define(addr("tcp/23"), vec![binding("telnet", 23)]).unwrap();
        for port in 1000..1010 {
            builder
                .define(Address::any(Protocol::Tcp, port), vec![binding("http", port)])
                .unwrap();
        }
        builder.define(addr("udp/23"), vec![binding("echo", 23)]).unwrap();
        let registry = builder.build();

        assert_eq!(types(registry.lookup(&addr("tcp/23"))), ["telnet"]);
        assert_eq!(types(registry.lookup(&addr("udp/23"))), ["echo"]);
    }

    #[test]
    fn test_wildcard_lookup_from_socket_addresses() {
        let mut builder = Registry::builder();
        builder.define(addr("tcp/23"), vec![binding("telnet", 23)]).unwrap();
        let registry = builder.build();

        for local in ["0.0.0.0:23", "10.1.2.3:23", "127.0.0.1:23"] {
            let conn = Address::from_socket(Protocol::Tcp, local.parse().unwrap());
            assert_eq!(registry.lookup(&conn).len(), 1, "{local}");
        }
        let udp = Address::from_socket(Protocol::Udp, "10.1.2.3:23".parse().unwrap());
        assert!(registry.lookup(&udp).is_empty());
        assert!(registry.lookup(&addr("tcp/24")).is_empty());
    }

    #[test]
    fn test_redefinition_is_rejected() {
        let mut builder = Registry::builder();
        builder.define(addr("tcp/2222"), vec![binding("telnet", 2222)]).unwrap();

        let err = builder
            .define(addr("tcp/0.0.0.0:2222"), vec![binding("ssh", 2222)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict { .. }));
    }

    #[test]
    fn test_wildcard_overlap_is_rejected() {
        let mut builder = Registry::builder();
        builder
            .define(addr("tcp/127.0.0.1:2222"), vec![binding("telnet", 2222)])
            .unwrap();

        let err = builder
            .define(addr("tcp/2222"), vec![binding("ssh", 2222)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict { .. }));

        let err = builder
            .register(addr("tcp/2222"), binding("ssh", 2222))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict { .. }));
    }

    #[test]
    fn test_distinct_hosts_coexist() {
        let mut builder = Registry::builder();
        builder
            .define(addr("tcp/127.0.0.1:22"), vec![binding("ssh", 22)])
            .unwrap();
        builder
            .define(addr("tcp/127.0.0.2:22"), vec![binding("telnet", 22)])
            .unwrap();
        let registry = builder.build();

        assert_eq!(types(registry.lookup(&addr("tcp/127.0.0.2:22"))), ["telnet"]);
    }

    #[test]
    fn test_register_is_idempotent_per_binding() {
        let mut builder = Registry::builder();
        builder
            .register(addr("tcp/23"), binding("telnet", 23))
            .unwrap()
            .register(addr("tcp/23"), binding("telnet", 23))
            .unwrap()
            .register(addr("tcp/23"), binding("ssh", 23))
            .unwrap();
        let registry = builder.build();

        assert_eq!(types(registry.lookup(&addr("tcp/23"))), ["telnet", "ssh"]);
    }

    #[test]
    fn test_register_keeps_bindings_differing_beyond_type() {
        let mut builder = Registry::builder();
        builder
            .register(addr("tcp/23"), binding("telnet", 23))
            .unwrap()
            .register(
                addr("tcp/23"),
                Binding::new(DecoyService::unconditional(Noop), "other", "telnet", 23),
            )
            .unwrap();
        let registry = builder.build();

        let bindings = registry.lookup(&addr("tcp/23"));
        assert_eq!(types(bindings), ["telnet", "telnet"]);
        assert_eq!(bindings[1].sensor_name, "other");
    }

    #[test]
    fn test_shared_registry_swap() {
        let shared = SharedRegistry::new(Registry::default());
        let before = shared.snapshot();
        assert!(before.lookup(&addr("tcp/23")).is_empty());

        let mut builder = Registry::builder();
        builder.define(addr("tcp/23"), vec![binding("telnet", 23)]).unwrap();
        shared.replace(builder.build());

        assert!(before.lookup(&addr("tcp/23")).is_empty());
        assert_eq!(shared.snapshot().lookup(&addr("tcp/23")).len(), 1);
    }
}
