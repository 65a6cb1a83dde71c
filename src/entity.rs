//! Domain entity references and the operations performed on them.
//!
//! The crate never stores entities itself. Applications describe each mutation as an
//! [`Operation`] and register an [`EntityStore`] per entity type so abandoned
//! operations can be rebuilt during lock recovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of mutation performed on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Destroy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to one entity instance: its type name and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// The stable key used for locking and envelope grouping.
    pub fn key(&self) -> EntityKey {
        EntityKey(format!("{}:{}", self.entity_type, self.id))
    }
}

/// Stable identity string of an entity (`"<type>:<id>"`).
///
/// Ordering is lexicographic; multi-key lock acquisition relies on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Caller-context fields (e.g. the acting user) merged into envelopes and lock metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attribution(Map<String, Value>);

impl Attribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribution carrying only the acting user's id.
    pub fn current_user(id: impl Into<Value>) -> Self {
        Self::new().with("current_user_id", id)
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One mutation of one entity instance.
///
/// Created where the mutation is issued and consumed once by payload aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub entity: EntityRef,
    /// Version assigned by the entity store. Unknown for recovered destroys.
    pub version: Option<u64>,
    /// Serialized attribute snapshot. Ignored for destroys.
    pub attributes: Map<String, Value>,
}

impl Operation {
    pub fn create(entity: EntityRef, version: u64, attributes: Map<String, Value>) -> Self {
        Self {
            kind: OperationKind::Create,
            entity,
            version: Some(version),
            attributes,
        }
    }

    pub fn update(entity: EntityRef, version: u64, attributes: Map<String, Value>) -> Self {
        Self {
            kind: OperationKind::Update,
            entity,
            version: Some(version),
            attributes,
        }
    }

    pub fn destroy(entity: EntityRef, version: Option<u64>) -> Self {
        Self {
            kind: OperationKind::Destroy,
            entity,
            version,
            attributes: Map::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        self.entity.key()
    }
}

/// Current persisted state of an entity, as returned by an [`EntityStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub version: u64,
    pub attributes: Map<String, Value>,
}

/// Errors reported by an entity store lookup.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Read access to one entity type's persisted state.
///
/// Supplied by the application; the publisher only calls it while recovering
/// operations whose lock holder crashed.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Look up the current state of an entity, `None` if it no longer exists.
    async fn lookup_by_id(&self, id: &str) -> Result<Option<EntitySnapshot>, StoreError>;
}

/// Mapping from entity type name to the store able to look it up.
#[derive(Default, Clone)]
pub struct EntityRegistry {
    stores: HashMap<String, Arc<dyn EntityStore>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entity_type: impl Into<String>, store: Arc<dyn EntityStore>) -> Self {
        self.stores.insert(entity_type.into(), store);
        self
    }

    pub fn get(&self, entity_type: &str) -> Option<&Arc<dyn EntityStore>> {
        self.stores.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entity_types", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
