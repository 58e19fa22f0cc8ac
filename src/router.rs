//! Result routing
//!
//! Bridges a worker's result back to the connection that uploaded the image.
//! Each upload claims its submitter's `results:<id>` channel before the job
//! is dispatched, waits for the first matching result, forwards it on the
//! live connection and queues it for persistence. The claim is released as
//! soon as the wait ends, whatever the outcome.
//!
//! A results channel can be claimed once at a time; a second concurrent
//! upload for the same channel is rejected with `submitter_busy` instead of
//! racing for it. Claims are keyed by channel name, so submitters `7` and
//! `"7"` share one.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;

use crate::bus::{MessageBus, Subscription};
use crate::codec;
use crate::error::{BusError, PipelineError};
use crate::metrics::{self, Timer};
use crate::persistence::{PersistJob, PersistenceQueue};
use crate::protocol::{results_channel, PredictionResult, ResultMessage, SubmitterId, TaskHandle};

#[derive(Clone)]
pub struct ResultRouter {
    bus: Arc<dyn MessageBus>,
    registry: Arc<DashMap<String, u64>>,
    persistence: PersistenceQueue,
}

/// Exclusive hold on a submitter's results channel
pub struct RouteClaim {
    channel: String,
    session_id: u64,
    subscription: Subscription,
    registry: Arc<DashMap<String, u64>>,
}

impl Drop for RouteClaim {
    fn drop(&mut self) {
        let session_id = self.session_id;
        self.registry
            .remove_if(&self.channel, |_, owner| *owner == session_id);
        tracing::trace!("Released {}", self.channel);
    }
}

/// How a result wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Result written to the connection
    Forwarded(PredictionResult),
    /// Connection was gone; the result, if one arrived, was still persisted
    Missed(Option<PredictionResult>),
}

impl ResultRouter {
    pub fn new(bus: Arc<dyn MessageBus>, persistence: PersistenceQueue) -> Self {
        Self {
            bus,
            registry: Arc::new(DashMap::new()),
            persistence,
        }
    }

    /// Number of submitters currently waiting on a result
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Reserve `submitter`'s channel for `session_id` and subscribe to it
    pub async fn claim(
        &self,
        submitter: &SubmitterId,
        session_id: u64,
    ) -> Result<RouteClaim, PipelineError> {
        let channel = results_channel(submitter);
        match self.registry.entry(channel.clone()) {
            Entry::Occupied(entry) => {
                metrics::SUBMITTER_BUSY.inc();
                tracing::warn!(
                    submitter = %submitter,
                    session = session_id,
                    owner = *entry.get(),
                    "Submitter already has an upload in flight"
                );
                return Err(PipelineError::SubmitterBusy(submitter.to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(session_id);
            }
        }

        match self.bus.subscribe(&channel).await {
            Ok(subscription) => Ok(RouteClaim {
                channel,
                session_id,
                subscription,
                registry: Arc::clone(&self.registry),
            }),
            Err(e) => {
                self.registry
                    .remove_if(&channel, |_, owner| *owner == session_id);
                Err(e.into())
            }
        }
    }

    /// Wait for the result of `task` and deliver it on `conn`
    ///
    /// The wait ends at the first of: a matching result, `timeout`, or
    /// `peer_closed` resolving. Results carrying a different task id are
    /// leftovers of an earlier upload; they are persisted but not forwarded.
    pub async fn await_result<W, C>(
        &self,
        mut claim: RouteClaim,
        task: &TaskHandle,
        timeout: Duration,
        conn: &mut W,
        peer_closed: C,
    ) -> Result<Delivery, PipelineError>
    where
        W: AsyncWrite + Unpin + Send,
        C: Future<Output = ()> + Send,
    {
        let timer = Timer::new();
        tokio::pin!(peer_closed);

        let received = tokio::select! {
            outcome = tokio::time::timeout(timeout, self.next_result(&mut claim, task)) => outcome,
            _ = &mut peer_closed => {
                metrics::DELIVERY_MISSES.inc();
                tracing::info!(task_id = %task.task_id, "Peer closed while waiting for result");
                return Ok(Delivery::Missed(None));
            }
        };
        drop(claim);

        let mut message = match received {
            Ok(message) => message?,
            Err(_) => {
                metrics::RESULT_TIMEOUTS.inc();
                tracing::warn!(
                    task_id = %task.task_id,
                    submitter = %task.submitter_id,
                    "No result within {:?}",
                    timeout
                );
                return Err(PipelineError::ResultTimeout(timeout));
            }
        };
        timer.observe_duration_seconds(&metrics::RESULT_WAIT_LATENCY);

        message.task_id = Some(task.task_id.clone());
        message.image_id = Some(task.image_id);
        let result = PredictionResult {
            image_id: task.image_id,
            label: message.final_result,
            confidence: message.confidence,
            raw_samples: message.details.clone(),
        };

        let delivery = match codec::write_frame(conn, &message).await {
            Ok(()) => {
                metrics::RESULTS_DELIVERED.inc();
                tracing::info!(
                    task_id = %task.task_id,
                    label = %result.label,
                    confidence = result.confidence,
                    "Result forwarded"
                );
                Delivery::Forwarded(result.clone())
            }
            Err(e) => {
                metrics::DELIVERY_MISSES.inc();
                tracing::warn!(task_id = %task.task_id, "Could not forward result: {}", e);
                Delivery::Missed(Some(result.clone()))
            }
        };

        self.persist(&result).await;
        Ok(delivery)
    }

    async fn next_result(
        &self,
        claim: &mut RouteClaim,
        task: &TaskHandle,
    ) -> Result<ResultMessage, PipelineError> {
        loop {
            let payload = match claim.subscription.recv().await {
                Ok(payload) => payload,
                Err(BusError::Lagged(skipped)) => {
                    tracing::warn!("Result subscriber lagged, {} messages skipped", skipped);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let message: ResultMessage = match serde_json::from_slice(&payload) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Ignoring unparsable result on {}: {}", claim.subscription.channel(), e);
                    continue;
                }
            };

            match (&message.task_id, message.image_id) {
                (Some(task_id), Some(image_id)) if *task_id != task.task_id => {
                    tracing::info!(task_id = %task_id, "Late result for an earlier upload");
                    self.persist(&PredictionResult {
                        image_id,
                        label: message.final_result,
                        confidence: message.confidence,
                        raw_samples: message.details,
                    })
                    .await;
                }
                (Some(task_id), None) if *task_id != task.task_id => {
                    tracing::info!(task_id = %task_id, "Ignoring result for another task");
                }
                _ => return Ok(message),
            }
        }
    }

    async fn persist(&self, result: &PredictionResult) {
        self.persistence
            .enqueue(PersistJob {
                image_id: result.image_id,
                label: result.label,
                confidence: result.confidence,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::PersistenceConfig;
    use crate::inference::Label;
    use crate::retry::RetryPolicy;
    use crate::storage::{PredictionStore, SledStore};
    use std::future::pending;

    struct Fixture {
        bus: Arc<LocalBus>,
        store: Arc<SledStore>,
        router: ResultRouter,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(LocalBus::default());
        let store = Arc::new(SledStore::temporary().unwrap());
        let (queue, _) = PersistenceQueue::spawn(store.clone(), &PersistenceConfig::default(), RetryPolicy::none());
        let router = ResultRouter::new(bus.clone(), queue);
        Fixture { bus, store, router }
    }

    fn result_for(submitter: SubmitterId, task_id: Option<&str>, image_id: Option<u64>) -> Vec<u8> {
        serde_json::to_vec(&ResultMessage {
            image: "server/uploads/leaf.jpg".to_string(),
            final_result: Label::Diseased,
            confidence: 60.0,
            details: vec![Label::Diseased, Label::Healthy, Label::Diseased, Label::Healthy, Label::Diseased],
            submitter_id: submitter,
            task_id: task_id.map(str::to_string),
            image_id,
        })
        .unwrap()
    }

    async fn wait_for_history(store: &SledStore, submitter: &SubmitterId, len: usize) {
        for _ in 0..100 {
            if store.list_predictions(submitter).await.unwrap().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("prediction was not persisted");
    }

    #[tokio::test]
    async fn test_second_claim_for_submitter_is_rejected() {
        let f = fixture();
        let submitter = SubmitterId::Number(1);

        let claim = f.router.claim(&submitter, 10).await.unwrap();
        let err = f.router.claim(&submitter, 11).await.err().unwrap();
        assert_eq!(err.kind(), "submitter_busy");

        drop(claim);
        assert_eq!(f.router.in_flight(), 0);
        assert_eq!(f.bus.subscriber_count("results:1"), 0);
        assert!(f.router.claim(&submitter, 11).await.is_ok());
    }

    #[tokio::test]
    async fn test_result_is_forwarded_and_persisted() {
        let f = fixture();
        let submitter = SubmitterId::Number(2);
        let image = f.store.create_image("uploads/2/leaf.jpg", &submitter).await.unwrap();
        let task = TaskHandle {
            task_id: "task-a".to_string(),
            image_id: image.id,
            submitter_id: submitter.clone(),
        };

        let claim = f.router.claim(&submitter, 1).await.unwrap();
        f.bus.publish("results:2", b"garbage".to_vec()).await.unwrap();
        f.bus.publish("results:2", result_for(submitter.clone(), None, None)).await.unwrap();

        let mut conn = Vec::new();
        let delivery = f
            .router
            .await_result(claim, &task, Duration::from_secs(1), &mut conn, pending())
            .await
            .unwrap();

        let forwarded = match delivery {
            Delivery::Forwarded(result) => result,
            other => panic!("unexpected delivery: {:?}", other),
        };
        assert_eq!(forwarded.image_id, image.id);
        assert_eq!(forwarded.label, Label::Diseased);

        let frame: serde_json::Value = serde_json::from_slice(&conn[4..]).unwrap();
        assert_eq!(frame["task_id"], "task-a");
        assert_eq!(frame["final_result"], "Diseased");
        assert_eq!(frame["submitter_id"], 2);

        assert_eq!(f.router.in_flight(), 0);
        wait_for_history(&f.store, &submitter, 1).await;
    }

    #[tokio::test]
    async fn test_late_result_of_earlier_task_is_not_forwarded() {
        let f = fixture();
        let submitter = SubmitterId::Text("eve".to_string());
        let old = f.store.create_image("uploads/eve/old.jpg", &submitter).await.unwrap();
        let new = f.store.create_image("uploads/eve/new.jpg", &submitter).await.unwrap();
        let task = TaskHandle {
            task_id: "task-new".to_string(),
            image_id: new.id,
            submitter_id: submitter.clone(),
        };

        let claim = f.router.claim(&submitter, 1).await.unwrap();
        f.bus
            .publish("results:eve", result_for(submitter.clone(), Some("task-old"), Some(old.id)))
            .await
            .unwrap();
        f.bus
            .publish("results:eve", result_for(submitter.clone(), Some("task-new"), Some(new.id)))
            .await
            .unwrap();

        let mut conn = Vec::new();
        let delivery = f
            .router
            .await_result(claim, &task, Duration::from_secs(1), &mut conn, pending())
            .await
            .unwrap();
        assert!(matches!(delivery, Delivery::Forwarded(ref r) if r.image_id == new.id));

        let frame: serde_json::Value = serde_json::from_slice(&conn[4..]).unwrap();
        assert_eq!(frame["task_id"], "task-new");
        wait_for_history(&f.store, &submitter, 2).await;
    }

    #[tokio::test]
    async fn test_wait_times_out_and_releases_claim() {
        let f = fixture();
        let submitter = SubmitterId::Number(3);
        let task = TaskHandle {
            task_id: "task-t".to_string(),
            image_id: 1,
            submitter_id: submitter.clone(),
        };

        let claim = f.router.claim(&submitter, 1).await.unwrap();
        let mut conn = Vec::new();
        let err = f
            .router
            .await_result(claim, &task, Duration::from_millis(30), &mut conn, pending())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "result_timeout");
        assert!(conn.is_empty());
        assert_eq!(f.router.in_flight(), 0);
        assert_eq!(f.bus.subscriber_count("results:3"), 0);
    }

    #[tokio::test]
    async fn test_peer_close_cancels_wait() {
        let f = fixture();
        let submitter = SubmitterId::Number(4);
        let task = TaskHandle {
            task_id: "task-p".to_string(),
            image_id: 1,
            submitter_id: submitter.clone(),
        };

        let claim = f.router.claim(&submitter, 1).await.unwrap();
        let mut conn = Vec::new();
        let delivery = f
            .router
            .await_result(claim, &task, Duration::from_secs(5), &mut conn, async {})
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Missed(None));
        assert_eq!(f.router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_numeric_and_text_ids_share_one_claim() {
        let f = fixture();
        let _claim = f.router.claim(&SubmitterId::Number(7), 1).await.unwrap();

        let err = f.router.claim(&SubmitterId::Text("7".into()), 2).await.err().unwrap();
        assert_eq!(err.kind(), "submitter_busy");
        assert_eq!(f.router.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_result_for_closed_connection_is_still_persisted() {
        let f = fixture();
        let submitter = SubmitterId::Number(5);
        let image = f.store.create_image("uploads/5/leaf.jpg", &submitter).await.unwrap();
        let task = TaskHandle {
            task_id: "task-gone".to_string(),
            image_id: image.id,
            submitter_id: submitter.clone(),
        };

        let claim = f.router.claim(&submitter, 1).await.unwrap();
        f.bus
            .publish("results:5", result_for(submitter.clone(), Some("task-gone"), Some(image.id)))
            .await
            .unwrap();

        let mut conn = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let delivery = f
            .router
            .await_result(claim, &task, Duration::from_secs(1), &mut conn, pending())
            .await
            .unwrap();

        match delivery {
            Delivery::Missed(Some(result)) => {
                assert_eq!(result.image_id, image.id);
                assert_eq!(result.label, Label::Diseased);
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
        assert_eq!(f.router.in_flight(), 0);
        assert_eq!(f.bus.subscriber_count("results:5"), 0);

        wait_for_history(&f.store, &submitter, 1).await;
        let history = f.store.list_predictions(&submitter).await.unwrap();
        assert_eq!(history[0].image_id, image.id);
        assert_eq!(history[0].confidence, 60.0);
    }
}
