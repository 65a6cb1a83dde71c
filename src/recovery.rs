//! Rebuilds operations abandoned by crashed lock holders.
//!
//! Stale lock metadata only names the operation kind, entity type and id. Destroys
//! are rebuilt from the id alone (the row may be gone); other kinds re-read the
//! entity's current state through the [`EntityRegistry`].

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::entity::{EntityKey, EntityRef, EntityRegistry, Operation, OperationKind};
use crate::lock::{LockMetadata, RecoveryHandler};
use crate::payload::PayloadBatch;

/// Errors raised while rebuilding an abandoned operation.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("No entity store registered for type '{0}'")]
    UnknownEntityType(String),

    #[error("Lookup of {entity_type} '{id}' failed: {message}")]
    Store {
        entity_type: String,
        id: String,
        message: String,
    },
}

/// Reconstruct the operation described by stale lock metadata.
///
/// Returns `None` when a non-destroy entity no longer exists.
pub async fn reconstruct_operation(
    registry: &EntityRegistry,
    stale: &LockMetadata,
) -> Result<Option<Operation>, RecoveryError> {
    let entity = EntityRef::new(&stale.entity_type, &stale.entity_id);

    if stale.kind == OperationKind::Destroy {
        return Ok(Some(Operation::destroy(entity, None)));
    }

    let store = registry
        .get(&stale.entity_type)
        .ok_or_else(|| RecoveryError::UnknownEntityType(stale.entity_type.clone()))?;

    let snapshot = store
        .lookup_by_id(&stale.entity_id)
        .await
        .map_err(|e| RecoveryError::Store {
            entity_type: stale.entity_type.clone(),
            id: stale.entity_id.clone(),
            message: e.to_string(),
        })?;

    Ok(snapshot.map(|snapshot| Operation {
        kind: stale.kind,
        entity,
        version: Some(snapshot.version),
        attributes: snapshot.attributes,
    }))
}

/// Recovery handler that queues rebuilt operations into a payload batch.
pub struct Recovery<'a> {
    registry: &'a EntityRegistry,
    batch: &'a mut PayloadBatch,
    recovered: usize,
}

impl<'a> Recovery<'a> {
    pub fn new(registry: &'a EntityRegistry, batch: &'a mut PayloadBatch) -> Self {
        Self {
            registry,
            batch,
            recovered: 0,
        }
    }

    /// Number of operations queued so far.
    pub fn recovered(&self) -> usize {
        self.recovered
    }
}

#[async_trait]
impl RecoveryHandler for Recovery<'_> {
    async fn recover(&mut self, key: &EntityKey, stale: LockMetadata) -> Result<(), RecoveryError> {
        match reconstruct_operation(self.registry, &stale).await? {
            Some(operation) => {
                debug!(key = %key, operation = %operation.kind, "Queued recovered operation");
                self.batch.add(&operation);
                self.recovered += 1;
            }
            None => {
                warn!(
                    key = %key,
                    operation = %stale.kind,
                    "Entity vanished before recovery, dropping abandoned operation"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map, Value};

    use super::*;
    use crate::entity::{Attribution, EntitySnapshot, EntityStore, StoreError};

    struct FixedStore(Option<EntitySnapshot>);

    #[async_trait]
    impl EntityStore for FixedStore {
        async fn lookup_by_id(&self, _id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl EntityStore for BrokenStore {
        async fn lookup_by_id(&self, _id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
            Err(StoreError("connection reset".to_string()))
        }
    }

    fn stale(kind: OperationKind, entity_type: &str) -> LockMetadata {
        LockMetadata {
            kind,
            attribution: Attribution::new(),
            entity_type: entity_type.to_string(),
            entity_id: "42".to_string(),
        }
    }

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_destroy_rebuilt_without_lookup() {
        let registry = EntityRegistry::new();
        let op = reconstruct_operation(&registry, &stale(OperationKind::Destroy, "User"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(op.kind, OperationKind::Destroy);
        assert_eq!(op.key().as_str(), "User:42");
        assert_eq!(op.version, None);
    }

    #[tokio::test]
    async fn test_update_rebuilt_from_current_state() {
        let registry = EntityRegistry::new().register(
            "User",
            Arc::new(FixedStore(Some(EntitySnapshot {
                version: 6,
                attributes: attrs(json!({"name": "Bob"})),
            }))),
        );

        let op = reconstruct_operation(&registry, &stale(OperationKind::Update, "User"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.version, Some(6));
        assert_eq!(op.attributes.get("name"), Some(&json!("Bob")));
    }

    #[tokio::test]
    async fn test_vanished_entity_yields_nothing() {
        let registry = EntityRegistry::new().register("User", Arc::new(FixedStore(None)));
        let op = reconstruct_operation(&registry, &stale(OperationKind::Create, "User"))
            .await
            .unwrap();
        assert!(op.is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_is_an_error() {
        let registry = EntityRegistry::new();
        let result = reconstruct_operation(&registry, &stale(OperationKind::Update, "Ghost")).await;
        assert!(matches!(result, Err(RecoveryError::UnknownEntityType(t)) if t == "Ghost"));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let registry = EntityRegistry::new().register("User", Arc::new(BrokenStore));
        let result = reconstruct_operation(&registry, &stale(OperationKind::Update, "User")).await;
        assert!(matches!(result, Err(RecoveryError::Store { .. })));
    }

    #[tokio::test]
    async fn test_recovery_handler_queues_into_batch() {
        let registry = EntityRegistry::new();
        let mut batch = PayloadBatch::new();
        let key = EntityKey::from("User:42");

        {
            let mut recovery = Recovery::new(&registry, &mut batch);
            recovery
                .recover(&key, stale(OperationKind::Destroy, "User"))
                .await
                .unwrap();
            assert_eq!(recovery.recovered(), 1);
        }

        assert_eq!(batch.fragments(&key).len(), 1);
    }
}
