//! Broker connectors for envelope delivery and consumption.
//!
//! This module contains:
//! - `BrokerConnector` trait: serialized, confirm-gated producer over one owned connection
//! - `ConsumerSession` trait: consumer-group fetch with caller-controlled offset commits
//! - `MessageHandler` / `MessageMetadata`: per-message processing and `ack()`
//! - Implementations: Kafka, in-memory channel broker, Mock

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::config::{BrokerConfig, BrokerType};
use crate::payload::Envelope;

// Implementation modules
pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;

// Re-exports
pub use channel::{ChannelBroker, ChannelConnector, ChannelConsumerSession};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConnector, KafkaConsumerSession};
pub use mock::MockConnector;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connector '{0}' is not connected")]
    NotConnected(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Send not acknowledged: {0}")]
    NotAcknowledged(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Whether a send that failed this way may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Publish(_) | BusError::NotAcknowledged(_))
    }
}

// ============================================================================
// Producer
// ============================================================================

/// A message ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Partitioning key (the entity key).
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn from_envelope(topic: impl Into<String>, envelope: &Envelope) -> serde_json::Result<Self> {
        Ok(Self {
            topic: topic.into(),
            key: envelope.key.to_string(),
            payload: envelope.to_json()?,
        })
    }
}

/// Invoked once the broker accepted a message, inside the connector's critical section.
pub type ConfirmCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Producer side of one broker.
///
/// Implementations own a single connection that is not safe for concurrent use.
/// `publish` runs the send and the confirm callback inside one mutual-exclusion
/// section scoped to the connector instance.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Establish the connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Tear down the connection. No-op if not connected.
    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Send a message and, once accepted, run `on_confirm`.
    ///
    /// Transport failures and unacknowledged sends are returned as errors and
    /// `on_confirm` is not run.
    async fn publish(&self, message: OutboundMessage, on_confirm: Option<ConfirmCallback>) -> Result<()>;
}

// ============================================================================
// Consumer
// ============================================================================

/// A message received from a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    /// Decode the payload as an envelope.
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(Envelope::from_json(&self.payload)?)
    }
}

/// Commits consumer-group offsets for a session.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Record `offset` as the next offset to consume on `partition`.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// Position of a received message, with an explicit commit.
#[derive(Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    committer: Arc<dyn OffsetCommitter>,
}

impl MessageMetadata {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, committer: Arc<dyn OffsetCommitter>) -> Self {
        let metadata = Self {
            topic: topic.into(),
            partition,
            offset,
            committer,
        };
        debug!(
            topic = %metadata.topic,
            partition = partition,
            offset = offset,
            "Message metadata"
        );
        metadata
    }

    /// Commit past this message (`offset + 1`) for its partition.
    ///
    /// Nothing is committed unless the caller acks, so unacked messages are
    /// redelivered to the group.
    pub async fn ack(&self) -> Result<()> {
        let next = self.offset + 1;
        debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = next,
            "Committing offset"
        );
        self.committer.commit(&self.topic, self.partition, next).await
    }
}

impl fmt::Debug for MessageMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMetadata")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Handler for processing consumed messages.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, metadata: MessageMetadata, message: ReceivedMessage) -> BoxFuture<'static, Result<()>>;
}

impl<F> MessageHandler for F
where
    F: Fn(MessageMetadata, ReceivedMessage) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    fn handle(&self, metadata: MessageMetadata, message: ReceivedMessage) -> BoxFuture<'static, Result<()>> {
        self(metadata, message)
    }
}

/// Consumer-group session on one topic.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Join the consumer group and subscribe to `topic`.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Pull one batch (no auto-commit) and run `handler` on each message in order.
    ///
    /// Returns the number of messages handled. A handler error stops the batch.
    async fn fetch_and_process(&mut self, handler: &dyn MessageHandler) -> Result<usize>;

    /// Leave the consumer group and close the session. Idempotent; later
    /// `subscribe` or `fetch_and_process` calls fail with `NotConnected`.
    async fn disconnect(&mut self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Build the connectors for the configured brokers, in configured order.
///
/// Connectors are returned unconnected.
/// Requires the corresponding feature for each broker type:
/// - Kafka: `--features kafka`
pub fn init_connectors(brokers: &[BrokerConfig], app: &str) -> Result<Vec<Arc<dyn BrokerConnector>>> {
    let mut connectors: Vec<Arc<dyn BrokerConnector>> = Vec::with_capacity(brokers.len());

    for broker in brokers {
        match broker.broker_type {
            BrokerType::Channel => {
                let connector = ChannelConnector::new(
                    &broker.name,
                    ChannelBroker::new(broker.partitions),
                    broker.producer.clone(),
                );
                connectors.push(Arc::new(connector));
            }
            BrokerType::Kafka => {
                #[cfg(feature = "kafka")]
                {
                    connectors.push(Arc::new(KafkaConnector::new(broker.clone(), app)));
                }

                #[cfg(not(feature = "kafka"))]
                {
                    let _ = app;
                    return Err(BusError::Connection(
                        "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                            .to_string(),
                    ));
                }
            }
        }
        info!(broker = %broker.name, broker_type = ?broker.broker_type, "Broker connector initialized");
    }

    Ok(connectors)
}

#[cfg(test)]
mod tests;
