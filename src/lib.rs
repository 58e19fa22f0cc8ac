pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod inference;
pub mod metrics;
pub mod mqtt_bus;
pub mod persistence;
pub mod protocol;
pub mod retry;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod worker;

// Re-export commonly used types for easier testing
pub use crate::bus::{LocalBus, MessageBus, QueueConsumer, Subscription};
pub use crate::client::{Client, UploadOutcome};
pub use crate::config::Config;
pub use crate::dispatcher::{BusWorkerPool, TaskDispatcher, WorkerPool};
pub use crate::error::{BusError, FrameError, PipelineError, StoreError};
pub use crate::inference::{Label, Simulator};
pub use crate::mqtt_bus::{MqttBus, MqttBusConfig};
pub use crate::persistence::{BackpressurePolicy, PersistenceQueue};
pub use crate::protocol::{ResultMessage, SubmitterId, TaskHandle};
pub use crate::router::ResultRouter;
pub use crate::server::Server;
pub use crate::session::{SessionContext, TransferSession};
pub use crate::storage::{PredictionStore, SledStore};
pub use crate::worker::ClassifyWorker;
