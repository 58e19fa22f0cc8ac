//! Background write path for predictions
//!
//! Results are forwarded to the client first and queued here afterwards, so
//! a slow or unavailable store never delays delivery. The queue is bounded;
//! what happens when it is full is decided by [`BackpressurePolicy`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::PersistenceConfig;
use crate::inference::Label;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::storage::PredictionStore;

/// Behaviour of [`PersistenceQueue::enqueue`] when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for room
    Block,
    /// Discard the job and count it
    Drop,
}

impl FromStr for BackpressurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop" => Ok(BackpressurePolicy::Drop),
            other => Err(anyhow::anyhow!("Unknown backpressure policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistJob {
    pub image_id: u64,
    pub label: Label,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Dropped,
}

/// Producer side of the write queue; cheap to clone
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<PersistJob>,
    policy: BackpressurePolicy,
}

impl PersistenceQueue {
    /// Start `config.workers` writer tasks draining a queue of
    /// `config.queue_capacity` jobs into `store`
    ///
    /// Writers stop once every queue handle is dropped and the queue is empty.
    pub fn spawn(
        store: Arc<dyn PredictionStore>,
        config: &PersistenceConfig,
        retry: RetryPolicy,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));

        let workers = config.workers.max(1);
        let handles = (0..workers)
            .map(|worker_id| {
                let rx = Arc::clone(&shared_rx);
                let store = Arc::clone(&store);
                let retry = retry.clone();
                tokio::spawn(async move { write_loop(worker_id, rx, store, retry).await })
            })
            .collect();

        tracing::info!(
            "Persistence queue started: capacity={}, workers={}, backpressure={:?}",
            config.queue_capacity,
            workers,
            config.backpressure
        );

        (
            Self {
                tx,
                policy: config.backpressure,
            },
            handles,
        )
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub async fn enqueue(&self, job: PersistJob) -> EnqueueOutcome {
        let image_id = job.image_id;
        let job = match self.tx.try_send(job) {
            Ok(()) => {
                metrics::PERSIST_QUEUE_DEPTH.inc();
                return EnqueueOutcome::Enqueued;
            }
            Err(mpsc::error::TrySendError::Full(job)) => job,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!(image_id, "Persistence queue closed, prediction lost");
                metrics::PERSIST_DROPPED.inc();
                return EnqueueOutcome::Dropped;
            }
        };

        match self.policy {
            BackpressurePolicy::Block => {
                tracing::debug!(image_id, "Persistence queue full, waiting for room");
                match self.tx.send(job).await {
                    Ok(()) => {
                        metrics::PERSIST_QUEUE_DEPTH.inc();
                        EnqueueOutcome::Enqueued
                    }
                    Err(_) => {
                        tracing::error!(image_id, "Persistence queue closed, prediction lost");
                        metrics::PERSIST_DROPPED.inc();
                        EnqueueOutcome::Dropped
                    }
                }
            }
            BackpressurePolicy::Drop => {
                tracing::warn!(image_id, "Persistence queue full, prediction dropped");
                metrics::PERSIST_DROPPED.inc();
                EnqueueOutcome::Dropped
            }
        }
    }
}

async fn write_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<PersistJob>>>,
    store: Arc<dyn PredictionStore>,
    retry: RetryPolicy,
) {
    tracing::debug!("Persistence writer {} started", worker_id);
    loop {
        // lock is held only while waiting for the next job
        let job = match rx.lock().await.recv().await {
            Some(job) => job,
            None => break,
        };
        metrics::PERSIST_QUEUE_DEPTH.dec();

        let outcome = retry
            .execute(|| store.save_prediction(job.image_id, job.label, job.confidence))
            .await;
        match outcome {
            Ok(()) => {
                metrics::PERSIST_WRITES.inc();
                tracing::debug!(
                    image_id = job.image_id,
                    label = %job.label,
                    "Prediction persisted"
                );
            }
            Err(e) => {
                metrics::PERSIST_FAILURES.inc();
                tracing::error!(image_id = job.image_id, "Failed to persist prediction: {}", e);
            }
        }
    }
    tracing::debug!("Persistence writer {} stopped", worker_id);
}
