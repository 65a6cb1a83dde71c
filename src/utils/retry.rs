//! Retry utilities: backoff builders for broker sends and connections.
//!
//! Uses `backon`. Sends retry on a fixed interval (the producer's configured
//! backoff); connection attempts back off exponentially with jitter.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

use crate::config::ProducerConfig;

/// Fixed-interval backoff for broker sends.
///
/// - Delay: `retry_backoff_ms`
/// - Max attempts after the first: `max_send_retries`
pub fn send_backoff(config: &ProducerConfig) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_millis(config.retry_backoff_ms))
        .with_max_times(config.max_send_retries)
}

/// Backoff for connection attempts at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use backon::Retryable;

    use super::*;

    #[tokio::test]
    async fn test_send_backoff_gives_up_after_configured_retries() {
        let config = ProducerConfig {
            max_send_retries: 3,
            retry_backoff_ms: 1,
            ..ProducerConfig::default()
        };
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<(), &str> = (|| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .retry(send_backoff(&config))
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_send_backoff_zero_retries_is_single_attempt() {
        let config = ProducerConfig {
            max_send_retries: 0,
            ..ProducerConfig::default()
        };
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<(), &str> = (|| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .retry(send_backoff(&config))
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
