//! Standalone classification worker
//!
//! Joins the MQTT bus, consumes `tasks:classify` through the shared
//! subscription `$share/leafscan-workers/tasks:classify` and publishes
//! results on the submitters' result channels. Every job goes to one of
//! the running workers, so run as many as needed next to a node started
//! with `WORKER_EMBEDDED=false`.

use anyhow::Result;
use std::sync::Arc;

use leafscan_node::config::Config;
use leafscan_node::metrics;
use leafscan_node::mqtt_bus::{MqttBus, MqttBusConfig};
use leafscan_node::worker::ClassifyWorker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    metrics::init_metrics();
    let config = Config::load()?;

    let mut bus_config = MqttBusConfig::from(&config.bus_config);
    bus_config.client_id = format!("leafscan-worker-{}", uuid::Uuid::new_v4());
    let (bus, eventloop) = MqttBus::connect(bus_config);

    let worker = ClassifyWorker::new(
        Arc::new(bus),
        &config.worker_config,
        config.dispatch_config.retry_policy(),
    );

    tokio::select! {
        outcome = worker.run() => outcome?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Worker shutting down"),
    }
    eventloop.abort();
    Ok(())
}
