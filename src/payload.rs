//! Payload aggregation and the envelope wire format.
//!
//! Operations are grouped per entity key into a [`PayloadBatch`]; each non-empty
//! key becomes one [`Envelope`] per publish cycle. Serialized as JSON:
//!
//! ```text
//! { "operations": [ { "operation": "update", "version": 5, ...attributes } ],
//!   "app": "...", "timestamp": <epoch ms>, "generation": "...",
//!   "host": "...", "key": "User:42", ...attribution }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{Attribution, EntityKey, Operation, OperationKind};

/// One operation's contribution to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadFragment {
    pub operation: OperationKind,
    pub version: Option<u64>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl PayloadFragment {
    pub fn from_operation(operation: &Operation) -> Self {
        let attributes = match operation.kind {
            OperationKind::Destroy => Map::new(),
            _ => operation.attributes.clone(),
        };
        Self {
            operation: operation.kind,
            version: operation.version,
            attributes,
        }
    }
}

/// Provenance fields stamped on every envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeContext {
    pub app: String,
    pub generation: String,
    pub host: String,
}

impl EnvelopeContext {
    /// Context for this process; the host is the machine's hostname.
    pub fn new(app: impl Into<String>, generation: impl Into<String>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            app: app.into(),
            generation: generation.into(),
            host,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// The unit put on the wire: every pending fragment for one entity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub operations: Vec<PayloadFragment>,
    pub app: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub generation: String,
    pub host: String,
    pub key: EntityKey,
    #[serde(flatten)]
    pub attribution: Attribution,
}

impl Envelope {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Fragments awaiting publish, grouped by entity key in key order.
#[derive(Debug, Clone, Default)]
pub struct PayloadBatch {
    entries: BTreeMap<EntityKey, Vec<PayloadFragment>>,
}

impl PayloadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation's fragment under its entity key, after any already queued.
    pub fn add(&mut self, operation: &Operation) {
        self.entries
            .entry(operation.key())
            .or_default()
            .push(PayloadFragment::from_operation(operation));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    pub fn fragments(&self, key: &EntityKey) -> &[PayloadFragment] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// One envelope per key with at least one fragment.
    pub fn build_envelopes(&self, context: &EnvelopeContext, attribution: &Attribution) -> Vec<Envelope> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        self.entries
            .iter()
            .filter(|(_, fragments)| !fragments.is_empty())
            .map(|(key, fragments)| Envelope {
                operations: fragments.clone(),
                app: context.app.clone(),
                timestamp,
                generation: context.generation.clone(),
                host: context.host.clone(),
                key: key.clone(),
                attribution: attribution.clone(),
            })
            .collect()
    }
}
