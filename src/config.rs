use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::persistence::BackpressurePolicy;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub http_host: String,
    pub http_port: u16,
    pub session_config: SessionConfig,
    pub dispatch_config: DispatchConfig,
    pub persistence_config: PersistenceConfig,
    pub bus_config: BusConfig,
    pub worker_config: WorkerConfig,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub upload_dir: PathBuf,
    pub chunk_size: usize,
    pub max_frame_bytes: u32,
    pub result_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub backpressure: BackpressurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BusBackend {
    Local,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub embedded: bool,
    pub concurrency: usize,
    pub samples: usize,
    pub sample_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("server/uploads"),
            chunk_size: 64 * 1024,
            max_frame_bytes: crate::codec::DEFAULT_MAX_FRAME_BYTES,
            result_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 3200,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 2,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Local,
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("leafscan-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embedded: true,
            concurrency: 4,
            samples: crate::inference::DEFAULT_SAMPLES,
            sample_delay: Duration::from_millis(1000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 5000,
            http_host: "0.0.0.0".to_string(),
            http_port: 9100,
            session_config: SessionConfig::default(),
            dispatch_config: DispatchConfig::default(),
            persistence_config: PersistenceConfig::default(),
            bus_config: BusConfig::default(),
            worker_config: WorkerConfig::default(),
            data_dir: PathBuf::from("./data/sled_db"),
        }
    }
}

/// Parse an env var, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Config::default();

        let listen_host = env::var("LISTEN_HOST").unwrap_or(defaults.listen_host);
        let listen_port = env_or("LISTEN_PORT", defaults.listen_port);
        let http_host = env::var("HTTP_HOST").unwrap_or(defaults.http_host);
        let http_port = env_or("HTTP_PORT", defaults.http_port);

        // Session / wire protocol
        let session = defaults.session_config;
        let chunk_size = env_or("CHUNK_SIZE", session.chunk_size);
        if chunk_size == 0 {
            return Err(anyhow::anyhow!("CHUNK_SIZE must be greater than zero"));
        }
        let session_config = SessionConfig {
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(session.upload_dir),
            chunk_size,
            max_frame_bytes: env_or("MAX_FRAME_BYTES", session.max_frame_bytes),
            result_timeout: Duration::from_secs(env_or(
                "RESULT_TIMEOUT_SECS",
                session.result_timeout.as_secs(),
            )),
        };

        // Dispatch backoff
        let dispatch = defaults.dispatch_config;
        let dispatch_config = DispatchConfig {
            max_attempts: env_or("DISPATCH_MAX_ATTEMPTS", dispatch.max_attempts),
            base_delay_ms: env_or("DISPATCH_BASE_DELAY_MS", dispatch.base_delay_ms),
            max_delay_ms: env_or("DISPATCH_MAX_DELAY_MS", dispatch.max_delay_ms),
        };

        // Persistence write path
        let persistence = defaults.persistence_config;
        let backpressure = match env::var("PERSIST_BACKPRESSURE") {
            Ok(v) => v.parse()?,
            Err(_) => persistence.backpressure,
        };
        let persistence_config = PersistenceConfig {
            queue_capacity: env_or("PERSIST_QUEUE_CAPACITY", persistence.queue_capacity).max(1),
            workers: env_or("PERSIST_WORKERS", persistence.workers).max(1),
            backpressure,
        };

        // Bus
        let bus = defaults.bus_config;
        let backend = match env::var("BUS_BACKEND").as_deref() {
            Ok("mqtt") => BusBackend::Mqtt,
            Ok("local") | Err(_) => BusBackend::Local,
            Ok(other) => return Err(anyhow::anyhow!("Unknown BUS_BACKEND: {}", other)),
        };
        let bus_config = BusConfig {
            backend,
            broker_host: env::var("MQTT_BROKER_HOST").unwrap_or(bus.broker_host),
            broker_port: env_or("MQTT_BROKER_PORT", bus.broker_port),
            client_id: env::var("MQTT_CLIENT_ID").unwrap_or(bus.client_id),
        };

        // Classification workers
        let worker = defaults.worker_config;
        let worker_config = WorkerConfig {
            embedded: env_or("WORKER_EMBEDDED", worker.embedded),
            concurrency: env_or("WORKER_CONCURRENCY", worker.concurrency).max(1),
            samples: env_or("WORKER_SAMPLES", worker.samples).max(1),
            sample_delay: Duration::from_millis(env_or(
                "WORKER_SAMPLE_DELAY_MS",
                worker.sample_delay.as_millis() as u64,
            )),
        };

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Ok(Self {
            listen_host,
            listen_port,
            http_host,
            http_port,
            session_config,
            dispatch_config,
            persistence_config,
            bus_config,
            worker_config,
            data_dir,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}
