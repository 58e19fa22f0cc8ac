use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{Fanout, IdleTopic, MessageBus, QueueConsumer, Subscription, DEFAULT_CHANNEL_CAPACITY};
use crate::config::BusConfig;
use crate::error::BusError;

pub const DEFAULT_SHARE_GROUP: &str = "leafscan-workers";

/// Broker topic a queue consumer subscribes to; the broker hands each
/// message on `queue` to one member of `group`
pub fn shared_topic(group: &str, queue: &str) -> String {
    format!("$share/{}/{}", group, queue)
}

/// Configuration for the MQTT bus
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// Shared-subscription group joined by queue consumers
    pub share_group: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("leafscan-{}", uuid::Uuid::new_v4()),
            share_group: DEFAULT_SHARE_GROUP.to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl From<&BusConfig> for MqttBusConfig {
    fn from(config: &BusConfig) -> Self {
        Self {
            broker_host: config.broker_host.clone(),
            broker_port: config.broker_port,
            client_id: config.client_id.clone(),
            ..Self::default()
        }
    }
}

/// Bus backed by an MQTT broker (QoS 1, at-least-once)
///
/// Broker subscriptions follow local subscriber presence: the first local
/// subscriber on a channel subscribes at the broker, the last one leaving
/// unsubscribes. Queues use a shared subscription so that every job goes
/// to one worker process. Active channels and queues are re-subscribed
/// after every reconnect.
///
/// The broker accepts a queued job even when no worker is subscribed, so on
/// this backend a missing worker surfaces as a result timeout.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    share_group: Arc<str>,
    fanout: Arc<Fanout>,
    connected: Arc<AtomicBool>,
}

impl MqttBus {
    /// Create the client and spawn its event loop
    pub fn connect(config: MqttBusConfig) -> (Self, JoinHandle<()>) {
        let mut mqttoptions =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        mqttoptions.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqttoptions, 64);
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();

        let bus = Self {
            client,
            share_group: Arc::from(config.share_group.as_str()),
            fanout: Arc::new(Fanout::with_idle_notifier(DEFAULT_CHANNEL_CAPACITY, idle_tx)),
            connected: Arc::new(AtomicBool::new(false)),
        };

        tracing::info!(
            "MQTT bus connecting to {}:{} as {}",
            config.broker_host,
            config.broker_port,
            config.client_id
        );
        let handle = tokio::spawn(bus.clone().run(eventloop, idle_rx, config.reconnect_delay));
        (bus, handle)
    }

    async fn run(
        self,
        mut eventloop: EventLoop,
        mut idle_rx: mpsc::UnboundedReceiver<IdleTopic>,
        reconnect_delay: Duration,
    ) {
        tracing::info!("MQTT bus event loop started");

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            tracing::debug!("Received MQTT message on topic: {}", publish.topic);
                            self.fanout.route(&publish.topic, publish.payload.to_vec());
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("Connected to MQTT broker");
                            self.connected.store(true, Ordering::SeqCst);

                            // Subscriptions do not survive a clean session. This loop is
                            // the one draining the request queue, so never await here.
                            for channel in self.fanout.active_channels() {
                                if let Err(e) = self.client.try_subscribe(channel.as_str(), QoS::AtLeastOnce) {
                                    tracing::error!("Failed to re-subscribe to {}: {}", channel, e);
                                }
                            }
                            for queue in self.fanout.active_queues() {
                                let topic = shared_topic(&self.share_group, &queue);
                                if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                    tracing::error!("Failed to re-subscribe to {}: {}", topic, e);
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            tracing::info!("Disconnected from MQTT broker");
                            self.connected.store(false, Ordering::SeqCst);
                        }
                        Ok(Event::Incoming(Packet::SubAck(suback))) => {
                            tracing::debug!("MQTT subscription acknowledged: {:?}", suback.pkid);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!("MQTT connection error: {}", e);
                            self.connected.store(false, Ordering::SeqCst);
                            tokio::time::sleep(reconnect_delay).await;
                        }
                    }
                }

                Some(idle) = idle_rx.recv() => {
                    let topic = match idle {
                        IdleTopic::Channel(channel) if self.fanout.subscriber_count(&channel) == 0 => channel,
                        IdleTopic::Queue(queue) if self.fanout.consumer_count(&queue) == 0 => {
                            shared_topic(&self.share_group, &queue)
                        }
                        _ => continue,
                    };
                    tracing::debug!("Unsubscribing from idle topic {}", topic);
                    if let Err(e) = self.client.try_unsubscribe(topic.as_str()) {
                        tracing::warn!("Failed to unsubscribe from {}: {}", topic, e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Unavailable("not connected to MQTT broker".to_string()));
        }

        self.client
            .publish(channel, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let (subscription, first) = self.fanout.subscribe(channel);
        if first {
            // Dropping `subscription` on error releases the channel again
            self.client
                .subscribe(channel, QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::Unavailable(e.to_string()))?;
        }
        Ok(subscription)
    }

    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // the broker picks the consumer
        self.publish(queue, payload).await
    }

    async fn consume(&self, queue: &str) -> Result<QueueConsumer, BusError> {
        let (consumer, first) = self.fanout.consume(queue);
        if first {
            self.client
                .subscribe(shared_topic(&self.share_group, queue), QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::Unavailable(e.to_string()))?;
        }
        Ok(consumer)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
