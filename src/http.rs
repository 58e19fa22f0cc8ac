//! Health and metrics endpoint

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::bus::MessageBus;
use crate::metrics;

#[derive(Clone)]
pub struct HttpState {
    pub bus: Arc<dyn MessageBus>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the endpoint until the process exits
pub async fn serve(addr: &str, state: HttpState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health/metrics endpoint listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))
}

async fn health_handler(State(state): State<HttpState>) -> (StatusCode, Json<Value>) {
    let bus_connected = state.bus.is_connected();
    let status = if bus_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if bus_connected { "ok" } else { "degraded" },
            "bus_connected": bus_connected,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn metrics_handler() -> String {
    metrics::export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, QueueConsumer, Subscription};
    use crate::error::BusError;
    use async_trait::async_trait;

    struct DownBus;

    #[async_trait]
    impl MessageBus for DownBus {
        async fn publish(&self, _: &str, _: Vec<u8>) -> Result<(), BusError> {
            Err(BusError::Unavailable("down".into()))
        }

        async fn subscribe(&self, _: &str) -> Result<Subscription, BusError> {
            Err(BusError::Unavailable("down".into()))
        }

        async fn enqueue(&self, _: &str, _: Vec<u8>) -> Result<(), BusError> {
            Err(BusError::Unavailable("down".into()))
        }

        async fn consume(&self, _: &str) -> Result<QueueConsumer, BusError> {
            Err(BusError::Unavailable("down".into()))
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_health_reflects_bus_state() {
        let (status, Json(body)) = health_handler(State(HttpState {
            bus: Arc::new(LocalBus::default()),
        }))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bus_connected"], true);

        let (status, Json(body)) = health_handler(State(HttpState { bus: Arc::new(DownBus) })).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }
}
