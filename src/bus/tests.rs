use super::*;
use crate::entity::{Attribution, EntityKey};
use crate::payload::PayloadFragment;
use std::sync::Mutex as StdMutex;

/// Records commits instead of talking to a broker.
#[derive(Default)]
struct RecordingCommitter {
    commits: StdMutex<Vec<(String, i32, i64)>>,
}

#[async_trait]
impl OffsetCommitter for RecordingCommitter {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.commits
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, offset));
        Ok(())
    }
}

fn envelope() -> Envelope {
    Envelope {
        operations: Vec::<PayloadFragment>::new(),
        app: "crm".to_string(),
        timestamp: 1_700_000_000_000,
        generation: "1".to_string(),
        host: "web-1".to_string(),
        key: EntityKey::from("User:42"),
        attribution: Attribution::current_user(7),
    }
}

#[test]
fn test_retryable_classification() {
    assert!(BusError::Publish("timeout".into()).is_retryable());
    assert!(BusError::NotAcknowledged("no ack".into()).is_retryable());
    assert!(!BusError::NotConnected("primary".into()).is_retryable());
    assert!(!BusError::Connection("refused".into()).is_retryable());
    assert!(!BusError::Commit("rebalance".into()).is_retryable());
}

#[test]
fn test_outbound_message_keyed_by_entity() {
    let envelope = envelope();
    let message = OutboundMessage::from_envelope("promulgate.events", &envelope).unwrap();

    assert_eq!(message.topic, "promulgate.events");
    assert_eq!(message.key, "User:42");
    assert_eq!(Envelope::from_json(&message.payload).unwrap(), envelope);
}

#[test]
fn test_received_message_decodes_envelope() {
    let envelope = envelope();
    let received = ReceivedMessage {
        topic: "promulgate.events".to_string(),
        partition: 0,
        offset: 3,
        key: Some("User:42".to_string()),
        payload: envelope.to_json().unwrap(),
    };
    assert_eq!(received.envelope().unwrap(), envelope);

    let garbage = ReceivedMessage {
        payload: b"not json".to_vec(),
        ..received
    };
    assert!(matches!(garbage.envelope(), Err(BusError::Serialization(_))));
}

#[tokio::test]
async fn test_ack_commits_offset_plus_one() {
    let committer = Arc::new(RecordingCommitter::default());
    let metadata = MessageMetadata::new("promulgate.events", 2, 41, committer.clone());

    metadata.ack().await.unwrap();

    let commits = committer.commits.lock().unwrap().clone();
    assert_eq!(commits, vec![("promulgate.events".to_string(), 2, 42)]);
}

#[tokio::test]
async fn test_ack_out_of_order_commits_as_given() {
    let committer = Arc::new(RecordingCommitter::default());
    let later = MessageMetadata::new("t", 0, 9, committer.clone());
    let earlier = MessageMetadata::new("t", 0, 4, committer.clone());

    later.ack().await.unwrap();
    earlier.ack().await.unwrap();

    let offsets: Vec<i64> = committer
        .commits
        .lock()
        .unwrap()
        .iter()
        .map(|(_, _, offset)| *offset)
        .collect();
    assert_eq!(offsets, vec![10, 5]);
}

#[test]
fn test_metadata_debug_omits_committer() {
    let metadata = MessageMetadata::new("t", 1, 5, Arc::new(RecordingCommitter::default()));
    let debug = format!("{:?}", metadata);
    assert!(debug.contains("partition: 1"));
    assert!(!debug.contains("committer"));
}

#[tokio::test]
async fn test_init_connectors_channel_in_order() {
    let brokers = vec![
        BrokerConfig {
            name: "primary".to_string(),
            ..BrokerConfig::default()
        },
        BrokerConfig {
            name: "secondary".to_string(),
            ..BrokerConfig::default()
        },
    ];

    let connectors = init_connectors(&brokers, "crm").unwrap();

    let names: Vec<&str> = connectors.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["primary", "secondary"]);
    assert!(!connectors[0].is_connected().await);
}

#[test]
fn test_init_connectors_empty() {
    assert!(init_connectors(&[], "crm").unwrap().is_empty());
}

#[cfg(not(feature = "kafka"))]
#[test]
fn test_init_connectors_kafka_requires_feature() {
    let brokers = vec![BrokerConfig::kafka("primary", "localhost:9092")];
    assert!(matches!(
        init_connectors(&brokers, "crm"),
        Err(BusError::Connection(_))
    ));
}
