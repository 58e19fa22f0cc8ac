use anyhow::Result;
use std::sync::Arc;

use leafscan_node::bus::{LocalBus, MessageBus};
use leafscan_node::config::{BusBackend, Config};
use leafscan_node::dispatcher::{BusWorkerPool, TaskDispatcher};
use leafscan_node::http::{self, HttpState};
use leafscan_node::metrics;
use leafscan_node::mqtt_bus::{MqttBus, MqttBusConfig};
use leafscan_node::persistence::PersistenceQueue;
use leafscan_node::router::ResultRouter;
use leafscan_node::server::Server;
use leafscan_node::session::SessionContext;
use leafscan_node::storage::{PredictionStore, SledStore};
use leafscan_node::worker::ClassifyWorker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting leafscan ingestion node...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let config = Config::load()?;

    // Persistence store
    if let Some(parent) = config.data_dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::create_dir_all(&config.session_config.upload_dir).await?;
    let sled_store = SledStore::open(&config.data_dir)?;
    let store: Arc<dyn PredictionStore> = Arc::new(sled_store.clone());

    // Message bus
    let bus: Arc<dyn MessageBus> = match config.bus_config.backend {
        BusBackend::Local => {
            tracing::info!("Using in-process message bus");
            Arc::new(LocalBus::default())
        }
        BusBackend::Mqtt => {
            let (mqtt_bus, _eventloop) = MqttBus::connect(MqttBusConfig::from(&config.bus_config));
            Arc::new(mqtt_bus)
        }
    };

    let retry = config.dispatch_config.retry_policy();
    let (persistence, writers) =
        PersistenceQueue::spawn(Arc::clone(&store), &config.persistence_config, retry.clone());

    if config.worker_config.embedded {
        let worker = ClassifyWorker::new(Arc::clone(&bus), &config.worker_config, retry.clone());
        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!("Embedded classification worker stopped: {}", e);
            }
        });
    } else {
        tracing::info!("Embedded worker disabled; expecting leafscan-worker processes on the bus");
    }

    let http_addr = config.http_addr();
    let http_state = HttpState {
        bus: Arc::clone(&bus),
    };
    tokio::spawn(async move {
        if let Err(e) = http::serve(&http_addr, http_state).await {
            tracing::error!("Health endpoint failed: {}", e);
        }
    });

    let dispatcher = TaskDispatcher::new(Arc::new(BusWorkerPool::new(Arc::clone(&bus))), retry);
    let router = ResultRouter::new(Arc::clone(&bus), persistence);
    let ctx = Arc::new(SessionContext::new(
        config.session_config.clone(),
        store,
        dispatcher,
        router,
    ));

    let server = Server::bind(&config.listen_addr(), ctx).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    // Sessions hold queue handles; give in-flight writes a moment to land
    tracing::info!("Draining persistence writers...");
    let drain = async {
        for writer in writers {
            let _ = writer.await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("Persistence writers still busy at shutdown");
    }
    sled_store.flush().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
