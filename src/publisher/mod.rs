//! Transactional publishing of entity changes.
//!
//! [`TransactionalPublisher::execute`] wraps a mutation in the publish protocol:
//!
//! 1. lock every affected entity key in sorted order, recovering stale locks
//! 2. run the mutation
//! 3. aggregate one envelope per key and publish it to every connector in order
//! 4. release a key's lock only when the last connector confirms its envelope
//!
//! A key whose publish failed keeps its lock until it expires; the next
//! acquirer, or the background sweep, recovers and republishes it.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::bus::{init_connectors, BrokerConnector, BusError, ConfirmCallback, OutboundMessage};
use crate::config::{Config, PublisherConfig};
use crate::entity::{Attribution, EntityKey, EntityRegistry, Operation};
use crate::lock::{init_lock_backend, HeldLock, LockBackend, LockCoordinator, LockError, LockMetadata, LockOptions};
use crate::payload::{Envelope, EnvelopeContext, PayloadBatch};
use crate::recovery::{Recovery, RecoveryError};
use crate::utils::bootstrap::connect_all;

pub mod switch;

pub use switch::{DisabledScope, PublishSwitch};

/// Boxed error returned by a failed mutation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How publish failures surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Failures go to the error notifier; the mutation result is still returned.
    #[default]
    FireAndForget,
    /// The first failure is returned to the caller.
    Synchronous,
}

/// An envelope that could not be delivered, with the broker error.
#[derive(Debug, thiserror::Error)]
#[error("Publishing {} to '{}' failed: {}", .envelope.key, .connector, .cause)]
pub struct PublisherError {
    pub connector: String,
    #[source]
    pub cause: BusError,
    pub envelope: Box<Envelope>,
}

/// Errors returned by [`TransactionalPublisher::execute`].
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Lock unavailable: {0}")]
    LockUnavailable(EntityKey),

    #[error("Locking failed: {0}")]
    Lock(#[source] LockError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Mutation failed: {0}")]
    Mutation(#[source] BoxError),

    #[error(transparent)]
    Publish(#[from] PublisherError),

    #[error("Envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker setup failed: {0}")]
    Bus(#[from] BusError),
}

impl From<LockError> for TransactionError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Unavailable(key) => TransactionError::LockUnavailable(key),
            LockError::Recovery(e) => TransactionError::Recovery(e),
            other => TransactionError::Lock(other),
        }
    }
}

/// Receives fire-and-forget publish failures. Must not block.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, error: &PublisherError);
}

impl<F> ErrorNotifier for F
where
    F: Fn(&PublisherError) + Send + Sync,
{
    fn notify(&self, error: &PublisherError) {
        self(error)
    }
}

/// Notifier that logs failures at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ErrorNotifier for LogNotifier {
    fn notify(&self, error: &PublisherError) {
        error!(
            key = %error.envelope.key,
            connector = %error.connector,
            error = %error.cause,
            "Envelope not published, lock left to expire"
        );
    }
}

/// The operations one mutation performs, plus caller context.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    operations: Vec<Operation>,
    attribution: Attribution,
    mode: Option<PublishMode>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = attribution;
        self
    }

    /// Override the publisher's default mode for this transaction.
    pub fn mode(mut self, mode: PublishMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    fn lock_requests(&self) -> Vec<(EntityKey, LockMetadata)> {
        self.operations
            .iter()
            .map(|op| {
                let metadata = LockMetadata {
                    kind: op.kind,
                    attribution: self.attribution.clone(),
                    entity_type: op.entity.entity_type.clone(),
                    entity_id: op.entity.id.clone(),
                };
                (op.key(), metadata)
            })
            .collect()
    }
}

/// Handle to a running recovery task. Dropping it stops the task.
pub struct RecoveryTaskHandle {
    cancel: tokio::sync::watch::Sender<bool>,
}

impl RecoveryTaskHandle {
    /// Signal the recovery task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Runs mutations under the lock, aggregate, publish, release protocol.
pub struct TransactionalPublisher {
    coordinator: Arc<LockCoordinator>,
    registry: Arc<EntityRegistry>,
    connectors: Vec<Arc<dyn BrokerConnector>>,
    notifier: Arc<dyn ErrorNotifier>,
    context: EnvelopeContext,
    topic: String,
    mode: PublishMode,
    switch: PublishSwitch,
}

impl TransactionalPublisher {
    /// A publisher with no connectors, the log notifier and the global switch.
    pub fn new(
        config: &PublisherConfig,
        backend: Arc<dyn LockBackend>,
        options: LockOptions,
        registry: EntityRegistry,
    ) -> Self {
        Self {
            coordinator: Arc::new(LockCoordinator::new(backend, options)),
            registry: Arc::new(registry),
            connectors: Vec::new(),
            notifier: Arc::new(LogNotifier),
            context: EnvelopeContext::new(&config.app, &config.generation),
            topic: config.topic.clone(),
            mode: config.mode,
            switch: PublishSwitch::global().clone(),
        }
    }

    /// Build from configuration: lock backend, connectors (connected), defaults.
    pub async fn from_config(config: &Config, registry: EntityRegistry) -> Result<Self, TransactionError> {
        let backend = init_lock_backend(&config.lock).await?;
        let connectors = init_connectors(&config.messaging.brokers, &config.publisher.app)?;
        connect_all(&connectors).await?;

        if connectors.is_empty() {
            warn!("No brokers configured, envelopes will be dropped and locks released");
        }
        let entity_types: Vec<String> = registry.entity_types().map(str::to_string).collect();

        let publisher = Self::new(
            &config.publisher,
            backend,
            LockOptions::from(&config.lock),
            registry,
        )
        .with_connectors(connectors);

        info!(
            app = %config.publisher.app,
            topic = %config.publisher.topic,
            mode = ?config.publisher.mode,
            brokers = publisher.connectors.len(),
            entity_types = ?entity_types,
            "Transactional publisher initialized"
        );
        Ok(publisher)
    }

    /// Append a connector; envelopes go to connectors in the order they were added.
    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn with_connectors(mut self, connectors: impl IntoIterator<Item = Arc<dyn BrokerConnector>>) -> Self {
        self.connectors.extend(connectors);
        self
    }

    pub fn with_notifier(mut self, notifier: impl ErrorNotifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn with_switch(mut self, switch: PublishSwitch) -> Self {
        self.switch = switch;
        self
    }

    pub fn with_context(mut self, context: EnvelopeContext) -> Self {
        self.context = context;
        self
    }

    pub fn coordinator(&self) -> &Arc<LockCoordinator> {
        &self.coordinator
    }

    pub fn switch(&self) -> &PublishSwitch {
        &self.switch
    }

    /// Run `mutation` under the publish protocol for `transaction`'s operations.
    ///
    /// With [`PublishMode::FireAndForget`] the mutation's result is returned even
    /// when envelopes failed to publish.
    #[tracing::instrument(name = "publisher.execute", skip_all, fields(operations = transaction.operations.len()))]
    pub async fn execute<T, E, F, Fut>(&self, transaction: Transaction, mutation: F) -> Result<T, TransactionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if self.switch.is_disabled() {
            debug!("Publishing disabled, running mutation only");
            return mutation()
                .await
                .map_err(|e| TransactionError::Mutation(e.into()));
        }

        let mode = transaction.mode.unwrap_or(self.mode);
        let mut batch = PayloadBatch::new();
        let held = {
            let mut recovery = Recovery::new(&self.registry, &mut batch);
            self.coordinator
                .acquire_all(transaction.lock_requests(), &mut recovery)
                .await?
        };

        let value = match mutation().await {
            Ok(value) => value,
            Err(e) => {
                let e = TransactionError::Mutation(e.into());
                if batch.is_empty() {
                    self.coordinator.release_all(&held).await;
                } else {
                    warn!(error = %e, "Mutation failed, publishing recovered operations only");
                    if let Err(publish_error) = self
                        .publish_batch(&batch, &transaction.attribution, held, PublishMode::FireAndForget)
                        .await
                    {
                        warn!(error = %publish_error, "Recovered operations not published");
                    }
                }
                return Err(e);
            }
        };

        for operation in &transaction.operations {
            batch.add(operation);
        }

        self.publish_batch(&batch, &transaction.attribution, held, mode)
            .await?;
        Ok(value)
    }

    /// Run `work` with publishing disabled on this publisher's switch.
    pub async fn without_publishing<Fut: Future>(&self, work: Fut) -> Fut::Output {
        self.switch.without_publishing(work).await
    }

    /// Take over every expired lock and republish its abandoned operation.
    ///
    /// Returns the number of keys whose operation was republished.
    pub async fn recover_expired(&self) -> Result<usize, TransactionError> {
        let expired = self.coordinator.expired().await?;
        let mut recovered = 0;

        for (key, metadata) in expired {
            let attribution = metadata.attribution.clone();
            let mut batch = PayloadBatch::new();

            let (acquired, rebuilt) = {
                let mut recovery = Recovery::new(&self.registry, &mut batch);
                let acquired = self
                    .coordinator
                    .acquire_all(vec![(key.clone(), metadata)], &mut recovery)
                    .await;
                (acquired, recovery.recovered())
            };
            let held = match acquired {
                Ok(held) => held,
                Err(LockError::Unavailable(_)) => {
                    debug!(key = %key, "Expired lock taken over by another holder");
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to recover expired lock");
                    continue;
                }
            };

            match self.publish_batch(&batch, &attribution, held, self.mode).await {
                Ok(()) if rebuilt > 0 => recovered += 1,
                Ok(()) => {}
                Err(e) => warn!(key = %key, error = %e, "Recovered operation not published"),
            }
        }

        if recovered > 0 {
            info!(recovered = recovered, "Recovered expired locks");
        }
        Ok(recovered)
    }

    /// Spawn a background task that periodically runs [`Self::recover_expired`].
    ///
    /// Returns a handle that can be used to stop the task.
    pub fn spawn_recovery_worker(self: Arc<Self>, interval: Duration) -> RecoveryTaskHandle {
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Lock recovery task started");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.recover_expired().await {
                            error!(error = %e, "Lock recovery failed");
                        }
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            info!("Lock recovery task stopped");
                            break;
                        }
                    }
                }
            }
        });

        RecoveryTaskHandle { cancel: cancel_tx }
    }

    async fn publish_batch(
        &self,
        batch: &PayloadBatch,
        attribution: &Attribution,
        held: Vec<HeldLock>,
        mode: PublishMode,
    ) -> Result<(), TransactionError> {
        let envelopes = batch.build_envelopes(&self.context, attribution);
        let keys: BTreeSet<&EntityKey> = envelopes.iter().map(|e| &e.key).collect();

        let (mut locks, idle): (HashMap<EntityKey, HeldLock>, Vec<HeldLock>) = {
            let (with_envelope, idle): (Vec<HeldLock>, Vec<HeldLock>) =
                held.into_iter().partition(|lock| keys.contains(&lock.key));
            (
                with_envelope
                    .into_iter()
                    .map(|lock| (lock.key.clone(), lock))
                    .collect(),
                idle,
            )
        };
        self.coordinator.release_all(&idle).await;

        for envelope in envelopes {
            let lock = locks.remove(&envelope.key);
            if let Err(e) = self.publish_envelope(envelope, lock).await {
                match mode {
                    PublishMode::FireAndForget => self.notifier.notify(&e),
                    PublishMode::Synchronous => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Send one envelope to every connector in order. The last connector's confirm
    /// releases `lock`; on failure the lock stays held.
    async fn publish_envelope(&self, envelope: Envelope, mut lock: Option<HeldLock>) -> Result<(), PublisherError> {
        let message = match OutboundMessage::from_envelope(&self.topic, &envelope) {
            Ok(message) => message,
            Err(e) => {
                return Err(PublisherError {
                    connector: String::new(),
                    cause: BusError::Serialization(e),
                    envelope: Box::new(envelope),
                })
            }
        };

        if self.connectors.is_empty() {
            debug!(key = %envelope.key, "No connectors, treating envelope as confirmed");
            if let Some(lock) = lock {
                self.coordinator.release_all(&[lock]).await;
            }
            return Ok(());
        }

        let last = self.connectors.len() - 1;
        for (index, connector) in self.connectors.iter().enumerate() {
            let on_confirm = if index == last {
                lock.take().map(|lock| self.release_on_confirm(lock))
            } else {
                None
            };

            if let Err(cause) = connector.publish(message.clone(), on_confirm).await {
                warn!(
                    key = %envelope.key,
                    connector = %connector.name(),
                    error = %cause,
                    "Publish failed"
                );
                return Err(PublisherError {
                    connector: connector.name().to_string(),
                    cause,
                    envelope: Box::new(envelope),
                });
            }
            debug!(key = %envelope.key, connector = %connector.name(), "Envelope accepted");
        }
        Ok(())
    }

    fn release_on_confirm(&self, lock: HeldLock) -> ConfirmCallback {
        let coordinator = self.coordinator.clone();
        Box::new(move || {
            Box::pin(async move {
                coordinator.release_all(&[lock]).await;
            })
        })
    }
}
