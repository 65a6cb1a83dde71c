//! Kafka broker connector and consumer session.
//!
//! Envelopes are produced to a single configured topic, keyed by entity key so
//! every change to one entity lands on the same partition in order. The producer
//! waits for the delivery report before the confirm callback runs.
//!
//! Consumers never auto-commit; offsets are committed through
//! [`MessageMetadata::ack`](super::MessageMetadata::ack).

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BrokerConnector, BusError, ConfirmCallback, ConsumerSession, MessageHandler, MessageMetadata,
    OffsetCommitter, OutboundMessage, ReceivedMessage, Result,
};
use crate::config::BrokerConfig;

/// Client id in the form `<product>.<app>.<guid>`.
fn client_id(config: &BrokerConfig, app: &str) -> String {
    format!(
        "{}.{}.{}",
        config.producer.product,
        app,
        Uuid::new_v4().simple()
    )
}

/// Build a ClientConfig for producers.
fn build_producer_config(config: &BrokerConfig, client_id: &str) -> ClientConfig {
    let producer = &config.producer;
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("client.id", client_id);
    client.set("request.required.acks", producer.required_acks.to_string());
    client.set("compression.codec", &producer.compression);
    client.set(
        "topic.metadata.refresh.interval.ms",
        producer.metadata_refresh_interval_ms.to_string(),
    );
    client.set("message.send.max.retries", producer.max_send_retries.to_string());
    client.set("retry.backoff.ms", producer.retry_backoff_ms.to_string());
    client.set("request.timeout.ms", producer.ack_timeout_ms.to_string());
    client.set("socket.timeout.ms", producer.socket_timeout_ms.to_string());

    apply_security_config(config, &mut client);
    client
}

/// Build a ClientConfig for consumers.
fn build_consumer_config(config: &BrokerConfig, group_id: &str) -> ClientConfig {
    let consumer = &config.consumer;
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("group.id", group_id);
    client.set("enable.auto.commit", "false");
    client.set(
        "auto.offset.reset",
        if consumer.test_mode { "latest" } else { "earliest" },
    );
    client.set("fetch.wait.max.ms", consumer.max_wait_ms.to_string());

    apply_security_config(config, &mut client);
    client
}

/// Apply security settings to a ClientConfig.
fn apply_security_config(config: &BrokerConfig, client: &mut ClientConfig) {
    if let Some(ref protocol) = config.security_protocol {
        client.set("security.protocol", protocol);
    }

    if let Some(ref mechanism) = config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }

    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }

    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }

    if let Some(ref ca_location) = config.ssl_ca_location {
        client.set("ssl.ca.location", ca_location);
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Kafka implementation of [`BrokerConnector`].
///
/// Transport-level retries are delegated to librdkafka
/// (`message.send.max.retries`, `retry.backoff.ms`).
pub struct KafkaConnector {
    config: BrokerConfig,
    client_id: String,
    producer: Mutex<Option<FutureProducer>>,
}

impl KafkaConnector {
    /// Create an unconnected connector.
    pub fn new(config: BrokerConfig, app: &str) -> Self {
        let client_id = client_id(&config, app);
        Self {
            config,
            client_id,
            producer: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> Result<()> {
        let mut producer = self.producer.lock().await;
        if producer.is_some() {
            return Ok(());
        }

        let created: FutureProducer = build_producer_config(&self.config, &self.client_id)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;
        *producer = Some(created);

        info!(
            connector = %self.config.name,
            bootstrap_servers = %self.config.bootstrap_servers,
            client_id = %self.client_id,
            "Connected to Kafka"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(producer) = self.producer.lock().await.take() else {
            return Ok(());
        };

        producer
            .flush(Duration::from_millis(self.config.producer.socket_timeout_ms))
            .map_err(|e| BusError::Connection(format!("Failed to flush Kafka producer: {}", e)))?;

        info!(connector = %self.config.name, "Disconnected from Kafka");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.producer.lock().await.is_some()
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(connector = %self.config.name, key = %message.key))]
    async fn publish(&self, message: OutboundMessage, on_confirm: Option<ConfirmCallback>) -> Result<()> {
        let guard = self.producer.lock().await;
        let producer = guard
            .as_ref()
            .ok_or_else(|| BusError::NotConnected(self.config.name.clone()))?;

        let record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .key(&message.key);

        let (partition, offset) = producer
            .send(record, Duration::from_millis(self.config.producer.ack_timeout_ms))
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

        if offset < 0 && self.config.producer.required_acks != 0 {
            return Err(BusError::NotAcknowledged(format!(
                "no offset assigned on partition {}",
                partition
            )));
        }

        debug!(
            topic = %message.topic,
            partition = partition,
            offset = offset,
            "Published envelope to Kafka"
        );

        if let Some(confirm) = on_confirm {
            confirm().await;
        }
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Holds the consumer weakly so outstanding acks cannot keep a closed session alive.
struct KafkaCommitter {
    consumer: Weak<StreamConsumer>,
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| BusError::Commit(e.to_string()))?;

        let consumer = self
            .consumer
            .upgrade()
            .ok_or_else(|| BusError::NotConnected("Kafka consumer session closed".to_string()))?;
        consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| BusError::Commit(e.to_string()))
    }
}

/// Kafka implementation of [`ConsumerSession`].
///
/// `disconnect` closes the underlying consumer; a closed session cannot be reused.
pub struct KafkaConsumerSession {
    consumer: Option<Arc<StreamConsumer>>,
    committer: Arc<KafkaCommitter>,
    group_id: String,
    max_wait: Duration,
    max_batch: usize,
}

impl KafkaConsumerSession {
    /// Create a session for the broker's consumer group (default: the app id).
    pub fn new(config: &BrokerConfig, app: &str) -> Result<Self> {
        let group_id = config.consumer.group_id_or(app);
        let consumer: StreamConsumer = build_consumer_config(config, &group_id)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;
        let consumer = Arc::new(consumer);

        Ok(Self {
            committer: Arc::new(KafkaCommitter {
                consumer: Arc::downgrade(&consumer),
            }),
            consumer: Some(consumer),
            group_id,
            max_wait: Duration::from_millis(config.consumer.max_wait_ms),
            max_batch: config.consumer.max_batch,
        })
    }

    fn consumer(&self) -> Result<&Arc<StreamConsumer>> {
        self.consumer
            .as_ref()
            .ok_or_else(|| BusError::NotConnected(format!("consumer group {} closed", self.group_id)))
    }

    async fn next_message(&self) -> Result<Option<ReceivedMessage>> {
        let consumer = self.consumer()?;
        match tokio::time::timeout(self.max_wait, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(BusError::Fetch(e.to_string())),
            Ok(Ok(message)) => Ok(Some(ReceivedMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
        }
    }
}

#[async_trait]
impl ConsumerSession for KafkaConsumerSession {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.consumer()?
            .subscribe(&[topic])
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to {}: {}", topic, e)))?;

        info!(group = %self.group_id, topic = %topic, "Subscribed to Kafka topic");
        Ok(())
    }

    async fn fetch_and_process(&mut self, handler: &dyn MessageHandler) -> Result<usize> {
        let mut handled = 0;

        while handled < self.max_batch {
            let Some(message) = self.next_message().await? else {
                break;
            };

            let metadata = MessageMetadata::new(
                &message.topic,
                message.partition,
                message.offset,
                self.committer.clone(),
            );

            if let Err(e) = handler.handle(metadata, message).await {
                warn!(group = %self.group_id, error = %e, "Handler failed, stopping batch");
                return Err(e);
            }
            handled += 1;
        }

        Ok(handled)
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Dropping the last reference closes the consumer and leaves the group
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            drop(consumer);
            info!(group = %self.group_id, "Left Kafka consumer group");
        }
        Ok(())
    }
}
