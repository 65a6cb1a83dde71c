//! Mock broker connector for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{BrokerConnector, BusError, ConfirmCallback, OutboundMessage, Result};

/// Shared, ordered record of `"{connector}:{key}"` entries across mock connectors.
pub type PublishJournal = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct MockConnection {
    published: Vec<OutboundMessage>,
}

/// Mock connector that records every accepted message.
pub struct MockConnector {
    name: String,
    connection: Mutex<Option<MockConnection>>,
    fail_on_publish: RwLock<bool>,
    reject_on_publish: RwLock<bool>,
    journal: Option<PublishJournal>,
}

impl MockConnector {
    /// A connected mock.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: Mutex::new(Some(MockConnection::default())),
            fail_on_publish: RwLock::new(false),
            reject_on_publish: RwLock::new(false),
            journal: None,
        }
    }

    /// Append accepted publishes to a journal shared with other mocks.
    pub fn with_journal(mut self, journal: PublishJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Make sends raise a transport error.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Make sends complete without acknowledgement.
    pub async fn set_reject_on_publish(&self, reject: bool) {
        *self.reject_on_publish.write().await = reject;
    }

    pub async fn published_count(&self) -> usize {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.published.len())
            .unwrap_or(0)
    }

    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(MockConnection::default());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connection.lock().await.take();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn publish(&self, message: OutboundMessage, on_confirm: Option<ConfirmCallback>) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let conn = connection
            .as_mut()
            .ok_or_else(|| BusError::NotConnected(self.name.clone()))?;

        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        if *self.reject_on_publish.read().await {
            return Err(BusError::NotAcknowledged("Mock broker did not acknowledge".to_string()));
        }

        if let Some(journal) = &self.journal {
            journal
                .lock()
                .await
                .push(format!("{}:{}", self.name, message.key));
        }
        conn.published.push(message);

        if let Some(confirm) = on_confirm {
            confirm().await;
        }
        Ok(())
    }
}
