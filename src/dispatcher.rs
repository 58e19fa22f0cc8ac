//! Task dispatch
//!
//! Hands a classification job to the worker pool and returns the handle
//! used to correlate its result. Enqueueing is retried with capped
//! exponential backoff; once attempts run out the upload is answered with
//! a `dispatch_unavailable` error.

use async_trait::async_trait;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::error::{BusError, PipelineError};
use crate::metrics;
use crate::protocol::{ClassifyJob, SubmitterId, TaskHandle, TASK_CHANNEL};
use crate::retry::RetryPolicy;

/// Anything that can accept a classification job
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn enqueue(&self, job: &ClassifyJob) -> Result<(), BusError>;
}

/// Worker pool reached through the task queue of a message bus
///
/// A queue without consumers refuses the job, which the dispatcher retries
/// and finally reports as `dispatch_unavailable`.
pub struct BusWorkerPool {
    bus: Arc<dyn MessageBus>,
}

impl BusWorkerPool {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl WorkerPool for BusWorkerPool {
    async fn enqueue(&self, job: &ClassifyJob) -> Result<(), BusError> {
        let payload = serde_json::to_vec(job)?;
        self.bus.enqueue(TASK_CHANNEL, payload).await
    }
}

#[derive(Clone)]
pub struct TaskDispatcher {
    pool: Arc<dyn WorkerPool>,
    retry: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(pool: Arc<dyn WorkerPool>, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Submit an image for classification
    pub async fn submit(
        &self,
        image_id: u64,
        image_path: &str,
        submitter: &SubmitterId,
    ) -> Result<TaskHandle, PipelineError> {
        let job = ClassifyJob {
            task_id: uuid::Uuid::new_v4().to_string(),
            image_id,
            image_path: image_path.to_string(),
            submitter_id: submitter.clone(),
        };

        let outcome = self
            .retry
            .execute(|| {
                metrics::DISPATCH_ATTEMPTS.inc();
                self.pool.enqueue(&job)
            })
            .await;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    task_id = %job.task_id,
                    image_id,
                    submitter = %submitter,
                    "Task dispatched"
                );
                Ok(TaskHandle {
                    task_id: job.task_id,
                    image_id,
                    submitter_id: job.submitter_id,
                })
            }
            Err(e) => {
                metrics::DISPATCH_FAILURES.inc();
                tracing::error!(image_id, submitter = %submitter, "Dispatch failed: {}", e);
                Err(PipelineError::DispatchUnavailable {
                    attempts: self.retry.max_attempts,
                    reason: e.to_string(),
                })
            }
        }
    }
}
