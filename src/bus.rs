//! Publish/subscribe bus
//!
//! Two kinds of address share one namespace of plain strings:
//!
//! - channels (`results:<submitter>`): every subscriber gets every message.
//!   Delivery is best effort; a message published while nobody is subscribed
//!   is dropped, and subscribers that fall behind skip messages.
//! - queues (`tasks:classify`): consumers compete and each message reaches
//!   exactly one of them. Queued messages are never dropped on the bus side.
//!
//! Both backends share a [`Fanout`] table holding the channels and queues.
//! [`LocalBus`] is just the table; the MQTT backend feeds it from the broker
//! connection.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::BusError;
use crate::metrics;

/// Per-channel buffer before slow subscribers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;

    /// Hand `payload` to one consumer of `queue`
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Join the competing consumers of `queue`
    async fn consume(&self, queue: &str) -> Result<QueueConsumer, BusError>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// Address that lost its last local subscriber or consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleTopic {
    Channel(String),
    Queue(String),
}

/// Unbounded hand-off shared by the consumers of one queue
struct WorkQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    consumers: AtomicUsize,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            consumers: AtomicUsize::new(0),
        }
    }
}

/// Channel and queue table shared by subscribers and the delivering side
pub struct Fanout {
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    queues: DashMap<String, WorkQueue>,
    capacity: usize,
    idle_tx: Option<mpsc::UnboundedSender<IdleTopic>>,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            queues: DashMap::new(),
            capacity: capacity.max(1),
            idle_tx: None,
        }
    }

    /// Fan-out table that reports addresses losing their last local user
    pub fn with_idle_notifier(capacity: usize, idle_tx: mpsc::UnboundedSender<IdleTopic>) -> Self {
        Self {
            idle_tx: Some(idle_tx),
            ..Self::new(capacity)
        }
    }

    /// Register a subscriber; the flag is true when the channel was not
    /// active before this call
    pub fn subscribe(self: &Arc<Self>, channel: &str) -> (Subscription, bool) {
        let mut first = false;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                first = true;
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        let subscription = Subscription {
            channel: channel.to_string(),
            rx: Some(rx),
            fanout: Arc::clone(self),
        };
        (subscription, first)
    }

    /// Hand `payload` to every current subscriber of `channel`
    ///
    /// Returns the number of subscribers reached; zero means the message was
    /// dropped.
    pub fn deliver(&self, channel: &str, payload: Vec<u8>) -> usize {
        let reached = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        if reached == 0 {
            metrics::BUS_MESSAGES_DROPPED.inc();
            tracing::debug!("No subscriber on channel {}, message dropped", channel);
        }
        reached
    }

    /// Channels that currently have at least one subscriber
    pub fn active_channels(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Register a consumer; the flag is true when the queue had none before
    ///
    /// Jobs queued while the queue had no consumer are kept for the next one.
    pub fn consume(self: &Arc<Self>, queue: &str) -> (QueueConsumer, bool) {
        let entry = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(WorkQueue::new);
        let first = entry.consumers.fetch_add(1, Ordering::SeqCst) == 0;
        let rx = Arc::clone(&entry.rx);
        drop(entry);

        let consumer = QueueConsumer {
            queue: queue.to_string(),
            rx,
            fanout: Arc::clone(self),
        };
        (consumer, first)
    }

    /// Queue `payload` for one consumer; fails when the queue has none
    pub fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        match self.queues.get(queue) {
            Some(entry) if entry.consumers.load(Ordering::SeqCst) > 0 => entry
                .tx
                .send(payload)
                .map_err(|_| BusError::Closed(queue.to_string())),
            _ => Err(BusError::Unavailable(format!("no consumer on {}", queue))),
        }
    }

    /// Hand a message arriving from outside to its queue or channel
    pub fn route(&self, topic: &str, payload: Vec<u8>) {
        if let Some(entry) = self.queues.get(topic) {
            // receiver lives in the entry, so this cannot fail
            let _ = entry.tx.send(payload);
            return;
        }
        self.deliver(topic, payload);
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|entry| entry.consumers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Queues that currently have at least one consumer
    pub fn active_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|entry| entry.consumers.load(Ordering::SeqCst) > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn release_queue(&self, queue: &str) {
        let last = self
            .queues
            .get(queue)
            .map(|entry| entry.consumers.fetch_sub(1, Ordering::SeqCst) == 1)
            .unwrap_or(false);

        if last {
            tracing::trace!("Queue {} has no consumers left", queue);
            if let Some(idle_tx) = &self.idle_tx {
                let _ = idle_tx.send(IdleTopic::Queue(queue.to_string()));
            }
        }
    }

    fn release(&self, channel: &str) {
        let removed = self
            .channels
            .remove_if(channel, |_, tx| tx.receiver_count() == 0)
            .is_some();

        if removed {
            tracing::trace!("Channel {} has no subscribers left", channel);
            if let Some(idle_tx) = &self.idle_tx {
                let _ = idle_tx.send(IdleTopic::Channel(channel.to_string()));
            }
        }
    }
}

/// A live subscription; dropping it tears the subscription down
pub struct Subscription {
    channel: String,
    rx: Option<broadcast::Receiver<Vec<u8>>>,
    fanout: Arc<Fanout>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message on this channel
    pub async fn recv(&mut self) -> Result<Vec<u8>, BusError> {
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return Err(BusError::Closed(self.channel.clone())),
        };

        match rx.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed(self.channel.clone())),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // receiver must be gone before the table checks the count
        drop(self.rx.take());
        self.fanout.release(&self.channel);
    }
}

/// Membership in a queue's consumer group; dropping it leaves the group
pub struct QueueConsumer {
    queue: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    fanout: Arc<Fanout>,
}

impl QueueConsumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next message no other consumer has taken
    pub async fn recv(&mut self) -> Result<Vec<u8>, BusError> {
        // lock is held only while waiting; mpsc recv is cancel safe
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(payload) => Ok(payload),
            None => Err(BusError::Closed(self.queue.clone())),
        }
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.fanout.release_queue(&self.queue);
    }
}

/// In-process bus for single-node deployments and tests
#[derive(Clone)]
pub struct LocalBus {
    fanout: Arc<Fanout>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            fanout: Arc::new(Fanout::new(capacity)),
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.fanout.subscriber_count(channel)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.fanout.consumer_count(queue)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.fanout.deliver(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let (subscription, _) = self.fanout.subscribe(channel);
        Ok(subscription)
    }

    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.fanout.enqueue(queue, payload)
    }

    async fn consume(&self, queue: &str) -> Result<QueueConsumer, BusError> {
        let (consumer, _) = self.fanout.consume(queue);
        Ok(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = LocalBus::default();
        let mut sub = bus.subscribe("results:1").await.unwrap();

        bus.publish("results:1", b"hello".to_vec()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let bus = LocalBus::default();
        bus.publish("results:nobody", b"lost".to_vec()).await.unwrap();

        // A later subscriber does not see earlier messages
        let mut sub = bus.subscribe("results:nobody").await.unwrap();
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = LocalBus::default();
        let mut one = bus.subscribe("results:1").await.unwrap();
        let mut two = bus.subscribe("results:2").await.unwrap();

        bus.publish("results:2", b"for-two".to_vec()).await.unwrap();
        assert_eq!(two.recv().await.unwrap(), b"for-two".to_vec());
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), one.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe("results:7").await.unwrap();
        let mut b = bus.subscribe("results:7").await.unwrap();
        assert_eq!(bus.subscriber_count("results:7"), 2);

        bus.publish("results:7", b"x".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"x".to_vec());
        assert_eq!(b.recv().await.unwrap(), b"x".to_vec());
    }

    #[tokio::test]
    async fn test_drop_tears_down_channel_and_notifies() {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let fanout = Arc::new(Fanout::with_idle_notifier(8, idle_tx));

        let (a, first) = fanout.subscribe("results:3");
        assert!(first);
        let (b, first) = fanout.subscribe("results:3");
        assert!(!first);

        drop(a);
        assert_eq!(fanout.subscriber_count("results:3"), 1);
        assert!(idle_rx.try_recv().is_err());

        drop(b);
        assert!(fanout.active_channels().is_empty());
        assert_eq!(idle_rx.recv().await.unwrap(), IdleTopic::Channel("results:3".into()));
    }

    #[tokio::test]
    async fn test_enqueue_without_consumer_is_unavailable() {
        let bus = LocalBus::default();
        let err = bus.enqueue("tasks:classify", b"job".to_vec()).await.unwrap_err();
        assert!(matches!(err, BusError::Unavailable(_)));

        let consumer = bus.consume("tasks:classify").await.unwrap();
        drop(consumer);
        assert!(bus.enqueue("tasks:classify", b"job".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_each_queued_message_reaches_one_consumer() {
        let bus = LocalBus::new(4);
        let mut a = bus.consume("tasks:classify").await.unwrap();
        let mut b = bus.consume("tasks:classify").await.unwrap();
        assert_eq!(bus.consumer_count("tasks:classify"), 2);

        // far more than the channel capacity, with nobody reading yet
        for i in 0..100u32 {
            bus.enqueue("tasks:classify", i.to_be_bytes().to_vec()).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..50 {
            seen.push(a.recv().await.unwrap());
            seen.push(b.recv().await.unwrap());
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 100);

        let idle = tokio::time::timeout(std::time::Duration::from_millis(20), a.recv()).await;
        assert!(idle.is_err());
    }

    #[tokio::test]
    async fn test_queued_jobs_wait_for_next_consumer() {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let fanout = Arc::new(Fanout::with_idle_notifier(8, idle_tx));

        let (first, is_first) = fanout.consume("tasks:classify");
        assert!(is_first);
        fanout.enqueue("tasks:classify", b"pending".to_vec()).unwrap();
        drop(first);
        assert_eq!(idle_rx.recv().await.unwrap(), IdleTopic::Queue("tasks:classify".into()));
        assert!(fanout.active_queues().is_empty());

        let (mut next, is_first) = fanout.consume("tasks:classify");
        assert!(is_first);
        assert_eq!(next.recv().await.unwrap(), b"pending".to_vec());
    }

    #[tokio::test]
    async fn test_route_prefers_queue_over_channel() {
        let fanout = Arc::new(Fanout::new(8));
        let (mut consumer, _) = fanout.consume("tasks:classify");
        let (mut sub, _) = fanout.subscribe("results:1");

        fanout.route("tasks:classify", b"job".to_vec());
        fanout.route("results:1", b"result".to_vec());

        assert_eq!(consumer.recv().await.unwrap(), b"job".to_vec());
        assert_eq!(sub.recv().await.unwrap(), b"result".to_vec());
    }
}
