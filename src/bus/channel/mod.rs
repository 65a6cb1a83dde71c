//! In-memory partitioned log broker for standalone mode.
//!
//! `ChannelBroker` keeps an append-only log per topic partition plus committed
//! offsets per consumer group, so the producer and consumer semantics of a real
//! broker (keyed partitioning, explicit offset commits, redelivery of unacked
//! messages) can be exercised without external dependencies.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    BrokerConnector, BusError, ConfirmCallback, ConsumerSession, MessageHandler, MessageMetadata,
    OffsetCommitter, OutboundMessage, ReceivedMessage, Result,
};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::utils::retry::send_backoff;

#[derive(Default)]
struct BrokerState {
    /// topic -> partition logs
    topics: HashMap<String, Vec<Vec<ReceivedMessage>>>,
    /// (group, topic, partition) -> next offset to consume
    committed: HashMap<(String, String, i32), i64>,
    fail_sends: usize,
    reject_sends: usize,
}

/// Shared in-process broker.
pub struct ChannelBroker {
    partitions: i32,
    state: Mutex<BrokerState>,
}

impl ChannelBroker {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.max(1),
            state: Mutex::new(BrokerState::default()),
        })
    }

    pub fn partitions(&self) -> i32 {
        self.partitions
    }

    /// Fail the next `count` sends with a transport error.
    pub async fn fail_next_sends(&self, count: usize) {
        self.state.lock().await.fail_sends = count;
    }

    /// Leave the next `count` sends unacknowledged.
    pub async fn reject_next_sends(&self, count: usize) {
        self.state.lock().await.reject_sends = count;
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Every record on `topic`, ordered by partition then offset.
    pub async fn records(&self, topic: &str) -> Vec<ReceivedMessage> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    async fn append(&self, message: &OutboundMessage) -> Result<(i32, i64)> {
        let mut state = self.state.lock().await;

        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(BusError::Publish("channel broker unreachable".to_string()));
        }
        if state.reject_sends > 0 {
            state.reject_sends -= 1;
            return Err(BusError::NotAcknowledged("channel broker dropped the send".to_string()));
        }

        let partition = self.partition_for(&message.key);
        let partitions = self.partitions as usize;
        let log = &mut state
            .topics
            .entry(message.topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions])[partition as usize];
        let offset = log.len() as i64;

        log.push(ReceivedMessage {
            topic: message.topic.clone(),
            partition,
            offset,
            key: Some(message.key.clone()),
            payload: message.payload.clone(),
        });

        Ok((partition, offset))
    }

    async fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }

    async fn fetch(&self, topic: &str, partition: i32, from: i64, max: usize) -> Vec<ReceivedMessage> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| {
                log.iter()
                    .skip(from.max(0) as usize)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        let mut state = self.state.lock().await;
        state
            .committed
            .insert((group.to_string(), topic.to_string(), partition), offset);
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Connector publishing to a [`ChannelBroker`].
pub struct ChannelConnector {
    name: String,
    broker: Arc<ChannelBroker>,
    producer: ProducerConfig,
    connection: Mutex<Option<Arc<ChannelBroker>>>,
}

impl ChannelConnector {
    /// Create an unconnected connector.
    pub fn new(name: impl Into<String>, broker: Arc<ChannelBroker>, producer: ProducerConfig) -> Self {
        Self {
            name: name.into(),
            broker,
            producer,
            connection: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &Arc<ChannelBroker> {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for ChannelConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(self.broker.clone());
            info!(connector = %self.name, "Channel connector connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connection.lock().await.take().is_some() {
            info!(connector = %self.name, "Channel connector disconnected");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(connector = %self.name, key = %message.key))]
    async fn publish(&self, message: OutboundMessage, on_confirm: Option<ConfirmCallback>) -> Result<()> {
        let connection = self.connection.lock().await;
        let broker = connection
            .as_ref()
            .ok_or_else(|| BusError::NotConnected(self.name.clone()))?;

        let outbound = &message;
        let (partition, offset) = (|| async move { broker.append(outbound).await })
            .retry(send_backoff(&self.producer))
            .when(BusError::is_retryable)
            .notify(|e: &BusError, delay: Duration| {
                warn!(connector = %self.name, error = %e, delay = ?delay, "Send failed, retrying");
            })
            .await?;

        debug!(
            topic = %message.topic,
            partition = partition,
            offset = offset,
            "Published to channel broker"
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

struct ChannelCommitter {
    broker: Arc<ChannelBroker>,
    group_id: String,
}

#[async_trait]
impl OffsetCommitter for ChannelCommitter {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.broker.commit(&self.group_id, topic, partition, offset).await;
        Ok(())
    }
}

/// Consumer-group session against a [`ChannelBroker`].
pub struct ChannelConsumerSession {
    broker: Arc<ChannelBroker>,
    group_id: String,
    config: ConsumerConfig,
    topic: Option<String>,
    positions: HashMap<i32, i64>,
    committer: Arc<ChannelCommitter>,
    closed: bool,
}

impl ChannelConsumerSession {
    pub fn new(broker: Arc<ChannelBroker>, group_id: impl Into<String>, config: ConsumerConfig) -> Self {
        let group_id = group_id.into();
        let committer = Arc::new(ChannelCommitter {
            broker: broker.clone(),
            group_id: group_id.clone(),
        });
        Self {
            broker,
            group_id,
            config,
            topic: None,
            positions: HashMap::new(),
            committer,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BusError::NotConnected(format!("consumer group {} closed", self.group_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerSession for ChannelConsumerSession {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        self.positions.clear();
        for partition in 0..self.broker.partitions() {
            let start = match self.broker.committed_offset(&self.group_id, topic, partition).await {
                Some(offset) => offset,
                None if self.config.test_mode => self.broker.end_offset(topic, partition).await,
                None => 0,
            };
            self.positions.insert(partition, start);
        }
        self.topic = Some(topic.to_string());

        info!(group = %self.group_id, topic = %topic, "Channel consumer subscribed");
        Ok(())
    }

    async fn fetch_and_process(&mut self, handler: &dyn MessageHandler) -> Result<usize> {
        self.ensure_open()?;
        let topic = self
            .topic
            .clone()
            .ok_or_else(|| BusError::Subscribe("session is not subscribed".to_string()))?;

        let mut batch = Vec::new();
        for partition in 0..self.broker.partitions() {
            let remaining = self.config.max_batch.saturating_sub(batch.len());
            if remaining == 0 {
                break;
            }
            let from = self.positions.get(&partition).copied().unwrap_or(0);
            batch.extend(self.broker.fetch(&topic, partition, from, remaining).await);
        }

        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(self.config.max_wait_ms)).await;
            return Ok(0);
        }

        let mut handled = 0;
        for message in batch {
            let metadata = MessageMetadata::new(
                &message.topic,
                message.partition,
                message.offset,
                self.committer.clone(),
            );
            let (partition, offset) = (message.partition, message.offset);

            handler.handle(metadata, message).await?;

            self.positions.insert(partition, offset + 1);
            handled += 1;
        }

        Ok(handled)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.topic = None;
        self.positions.clear();
        self.closed = true;
        debug!(group = %self.group_id, "Channel consumer left group");
        Ok(())
    }
}
