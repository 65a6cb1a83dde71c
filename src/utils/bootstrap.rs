//! Bootstrap utilities for services embedding the publisher.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::bus::{BrokerConnector, BusError};
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the PROMULGATE_LOG environment variable.
///
/// Defaults to "info" level if PROMULGATE_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect a broker connector with exponential backoff retry.
///
/// Returns the last error once retries are exhausted.
pub async fn connect_with_retry(connector: &dyn BrokerConnector) -> Result<(), BusError> {
    (move || connector.connect())
        .retry(connection_backoff())
        .notify(|e: &BusError, delay: Duration| {
            warn!(
                connector = %connector.name(),
                error = %e,
                delay = ?delay,
                "Broker not reachable, retrying"
            );
        })
        .await?;

    info!(connector = %connector.name(), "Broker connected");
    Ok(())
}

/// Connect every connector in order, stopping at the first that cannot connect.
pub async fn connect_all(connectors: &[Arc<dyn BrokerConnector>]) -> Result<(), BusError> {
    for connector in connectors {
        connect_with_retry(connector.as_ref()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockConnector;

    #[tokio::test]
    async fn test_connect_all_connects_in_order() {
        let primary = Arc::new(MockConnector::new("primary"));
        let secondary = Arc::new(MockConnector::new("secondary"));
        primary.disconnect().await.unwrap();
        secondary.disconnect().await.unwrap();

        let connectors: Vec<Arc<dyn BrokerConnector>> = vec![primary.clone(), secondary.clone()];
        connect_all(&connectors).await.unwrap();

        assert!(primary.is_connected().await);
        assert!(secondary.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_with_retry_already_connected() {
        let connector = MockConnector::new("primary");
        connect_with_retry(&connector).await.unwrap();
        assert!(connector.is_connected().await);
    }
}
