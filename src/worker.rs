//! Classification worker
//!
//! Consumes jobs from the task queue, runs the sampling policy and
//! publishes the outcome on the submitter's results channel.

use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::bus::MessageBus;
use crate::config::WorkerConfig;
use crate::error::BusError;
use crate::inference::Simulator;
use crate::metrics;
use crate::protocol::{results_channel, ClassifyJob, ResultMessage, TASK_CHANNEL};
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct ClassifyWorker {
    bus: Arc<dyn MessageBus>,
    simulator: Simulator,
    permits: Arc<Semaphore>,
    publish_retry: RetryPolicy,
}

impl ClassifyWorker {
    pub fn new(bus: Arc<dyn MessageBus>, config: &WorkerConfig, publish_retry: RetryPolicy) -> Self {
        Self {
            bus,
            simulator: Simulator::new(config.samples, config.sample_delay),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            publish_retry,
        }
    }

    /// Consume the task queue until it closes
    ///
    /// Workers compete for jobs: each job reaches exactly one worker. A job
    /// is only taken off the queue once a permit is free, so a busy worker
    /// leaves it to an idle one and the queue itself never sheds jobs.
    pub async fn run(self) -> Result<(), BusError> {
        let mut tasks = self.bus.consume(TASK_CHANNEL).await?;
        tracing::info!(
            "Classification worker consuming {} (concurrency={}, samples={})",
            TASK_CHANNEL,
            self.permits.available_permits(),
            self.simulator.samples()
        );

        loop {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };

            let payload = match tasks.recv().await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::info!("Task queue ended: {}", e);
                    return Ok(());
                }
            };

            let job: ClassifyJob = match serde_json::from_slice(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!("Discarding malformed job: {}", e);
                    continue;
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.process(job).await {
                    tracing::error!("Failed to publish classification result: {}", e);
                }
            });
        }
    }

    /// Classify one job and publish its result
    pub async fn process(&self, job: ClassifyJob) -> Result<ResultMessage, BusError> {
        tracing::debug!(task_id = %job.task_id, image = %job.image_path, "Classifying image");
        let vote = self.simulator.classify().await;

        let message = ResultMessage {
            image: job.image_path,
            final_result: vote.label,
            confidence: vote.confidence,
            details: vote.samples,
            submitter_id: job.submitter_id,
            task_id: Some(job.task_id),
            image_id: Some(job.image_id),
        };

        let channel = results_channel(&message.submitter_id);
        let payload = serde_json::to_vec(&message)?;
        self.publish_retry
            .execute(|| self.bus.publish(&channel, payload.clone()))
            .await?;

        metrics::TASKS_COMPLETED.inc();
        tracing::info!(
            task_id = ?message.task_id,
            label = %message.final_result,
            confidence = message.confidence,
            "Published classification result to {}",
            channel
        );
        Ok(message)
    }
}
