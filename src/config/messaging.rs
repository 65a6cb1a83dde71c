//! Broker (producer and consumer) configuration types.

use serde::Deserialize;

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process channel broker (no external broker).
    #[default]
    Channel,
    /// Apache Kafka.
    Kafka,
}

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Brokers every envelope is published to, in publish order.
    pub brokers: Vec<BrokerConfig>,
}

/// One broker the publisher delivers to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name used in logs and errors.
    pub name: String,
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Partition count for the in-process channel broker.
    pub partitions: i32,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
    /// Producer settings.
    pub producer: ProducerConfig,
    /// Consumer settings.
    pub consumer: ConsumerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "primary".to_string(),
            broker_type: BrokerType::Channel,
            bootstrap_servers: "localhost:9092".to_string(),
            partitions: 4,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Kafka broker with default producer/consumer settings.
    pub fn kafka(name: impl Into<String>, bootstrap_servers: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            broker_type: BrokerType::Kafka,
            bootstrap_servers: bootstrap_servers.into(),
            ..Self::default()
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }
}

/// Producer knobs. Defaults match a synchronous, single-ack producer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// First component of the client id (`<product>.<app>.<guid>`).
    pub product: String,
    /// Compression codec (none, gzip, snappy, lz4, zstd).
    pub compression: String,
    pub metadata_refresh_interval_ms: u64,
    /// Send attempts after the first before giving up.
    pub max_send_retries: usize,
    /// Delay between send attempts.
    pub retry_backoff_ms: u64,
    /// Broker acknowledgements required per send (0 disables confirmation).
    pub required_acks: i32,
    pub ack_timeout_ms: u64,
    pub socket_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            product: "promulgate".to_string(),
            compression: "none".to_string(),
            metadata_refresh_interval_ms: 600_000,
            max_send_retries: 10,
            retry_backoff_ms: 100,
            required_acks: 1,
            ack_timeout_ms: 1_000,
            socket_timeout_ms: 10_000,
        }
    }
}

/// Consumer knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer group id. Defaults to the application id.
    pub group_id: Option<String>,
    /// Start a fresh group at the log tail instead of the beginning.
    pub test_mode: bool,
    /// Upper bound on how long a fetch waits for messages.
    pub max_wait_ms: u64,
    /// Maximum messages handled per fetch.
    pub max_batch: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: None,
            test_mode: false,
            max_wait_ms: 10,
            max_batch: 100,
        }
    }
}

impl ConsumerConfig {
    /// Group id, falling back to the application id.
    pub fn group_id_or(&self, app: &str) -> String {
        self.group_id.clone().unwrap_or_else(|| app.to_string())
    }
}
