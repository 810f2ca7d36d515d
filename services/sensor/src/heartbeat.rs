//! Heartbeat loop.
//!
//! Periodically logs the hub counters so an operator (or a log shipper) can
//! tell the sensor is alive and how much traffic it is seeing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use crate::dispatch::{HubStats, HubStatsSnapshot};

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    sensor_name: String,
    stats: Arc<HubStats>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        sensor = %sensor_name,
        interval_secs = interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut interval_timer = tokio::time::interval(interval);
    // The first tick completes immediately.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let snapshot = stats.snapshot();
                info!(
                    sensor = %sensor_name,
                    stats = %render(&snapshot)?,
                    connections_active = snapshot.connections_active,
                    "Heartbeat"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

fn render(snapshot: &HubStatsSnapshot) -> Result<String> {
    Ok(serde_json::to_string(snapshot)?)
}
