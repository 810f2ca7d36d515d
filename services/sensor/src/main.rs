//! Kushtaka sensor
//!
//! Exposes decoy network services and records whoever touches them.
//!
//! This service:
//! - Binds every configured TCP address
//! - Resolves each connection to a decoy, peeking on shared ports
//! - Bounds every session by a deadline and preempts it on shutdown
//! - Logs decoy interaction and periodic hub counters as JSON

use std::sync::Arc;

use anyhow::{Context, Result};
use kushtaka_sensor::{
    heartbeat, Config, Hub, ServiceCatalogue, SharedRegistry, TcpSocketListener,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to KUSHTAKA_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kushtaka sensor");
    info!(
        sensor = %config.sensor_name,
        port_entries = config.ports.len(),
        session_timeout_secs = config.session_timeout.as_secs(),
        "Configuration loaded"
    );

    let registry = config.load_registry(ServiceCatalogue::builtin()).await?;
    let registry = Arc::new(SharedRegistry::new(registry));

    let listener = TcpSocketListener::bind(registry.snapshot().addresses())
        .await
        .context("failed to bind listeners")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub = Arc::new(Hub::new(config.hub_config(), Arc::clone(&registry)));
    let stats = hub.stats();
    let mut hub_handle = tokio::spawn(hub.run(listener, shutdown_rx.clone()));

    let heartbeat_handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        config.sensor_name.clone(),
        stats,
        config.heartbeat_interval,
        shutdown_rx,
    ));

    // Wait for shutdown signal or a hub failure
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        result = &mut hub_handle => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, reason = e.reason_code(), "Hub stopped");
                Err(anyhow::Error::new(e))
            }
            Err(e) => {
                error!(error = %e, "Hub task panicked");
                Err(anyhow::Error::new(e))
            }
        },
    };

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    if let Err(e) = heartbeat_handle.await {
        error!(error = %e, "Heartbeat task panicked");
    }
    if !hub_handle.is_finished() {
        let _ = hub_handle.await;
    }

    info!("Sensor shutdown complete");
    outcome
}
