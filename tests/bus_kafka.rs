//! Kafka connector and consumer session integration tests.
//!
//! Run with: cargo test --test bus_kafka --features kafka -- --ignored --nocapture
//!
//! Requires: KAFKA_BOOTSTRAP env var or Kafka on localhost:9092 with topic
//! auto-creation enabled.

#![cfg(feature = "kafka")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use promulgate::bus::{
    BrokerConnector, BusError, ConfirmCallback, ConsumerSession, KafkaConnector, KafkaConsumerSession,
    MessageMetadata, OutboundMessage, ReceivedMessage,
};
use promulgate::config::BrokerConfig;
use tokio::sync::Mutex;

fn bootstrap_servers() -> String {
    std::env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "localhost:9092".to_string())
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn broker_config(group: &str) -> BrokerConfig {
    let mut config = BrokerConfig::kafka("primary", bootstrap_servers());
    config.consumer.group_id = Some(group.to_string());
    config.consumer.max_wait_ms = 2_000;
    config.producer.ack_timeout_ms = 5_000;
    config
}

#[tokio::test]
#[ignore = "requires running Kafka broker"]
async fn test_kafka_publish_confirms_then_consumer_acks() {
    let topic = unique("promulgate-test");
    let group = unique("promulgate-group");
    let config = broker_config(&group);

    let connector = KafkaConnector::new(config.clone(), "it");
    connector.connect().await.expect("Failed to connect producer");

    let confirmed = Arc::new(AtomicBool::new(false));
    let flag = confirmed.clone();
    let callback: ConfirmCallback = Box::new(move || {
        async move {
            flag.store(true, Ordering::SeqCst);
        }
        .boxed()
    });

    connector
        .publish(
            OutboundMessage {
                topic: topic.clone(),
                key: "User:42".to_string(),
                payload: br#"{"operations":[]}"#.to_vec(),
            },
            Some(callback),
        )
        .await
        .expect("Publish failed");
    assert!(confirmed.load(Ordering::SeqCst));

    let mut session = KafkaConsumerSession::new(&config, "it").expect("Failed to create consumer");
    session.subscribe(&topic).await.unwrap();

    let received: Arc<Mutex<Vec<ReceivedMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = move |metadata: MessageMetadata, message: ReceivedMessage| -> BoxFuture<'static, Result<(), BusError>> {
        let sink = sink.clone();
        async move {
            sink.lock().await.push(message);
            metadata.ack().await
        }
        .boxed()
    };

    for _ in 0..15 {
        session.fetch_and_process(&handler).await.unwrap();
        if !received.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let received = received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].key.as_deref(), Some("User:42"));

    session.disconnect().await.unwrap();
    connector.disconnect().await.unwrap();
}
