//! In-process lock backend.
//!
//! Suitable for single-process deployments and tests. Expired entries are kept
//! until taken over or released so they can be observed as recovered.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LockBackend, LockMetadata, LockOutcome, Result};
use crate::entity::EntityKey;

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    metadata: LockMetadata,
    expires_at: Instant,
}

/// Lock table held in memory.
#[derive(Default)]
pub struct MemoryLockBackend {
    entries: Mutex<HashMap<EntityKey, Entry>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Metadata of the current claim on `key`, if any.
    pub async fn holder_metadata(&self, key: &EntityKey) -> Option<LockMetadata> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|entry| entry.metadata.clone())
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &EntityKey,
        token: &str,
        metadata: &LockMetadata,
        expiration: Duration,
    ) -> Result<LockOutcome> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let previous = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(LockOutcome::Unavailable),
            Some(entry) => Some(entry.metadata.clone()),
            None => None,
        };

        entries.insert(
            key.clone(),
            Entry {
                token: token.to_string(),
                metadata: metadata.clone(),
                expires_at: now + expiration,
            },
        );

        Ok(match previous {
            Some(stale) => LockOutcome::Recovered(stale),
            None => LockOutcome::Acquired,
        })
    }

    async fn extend(&self, key: &EntityKey, token: &str, expiration: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.token == token => {
                entry.expires_at = Instant::now() + expiration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &EntityKey, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn relinquish(&self, key: &EntityKey, token: &str, metadata: &LockMetadata) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.token == token => {
                entry.metadata = metadata.clone();
                entry.expires_at = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired(&self) -> Result<Vec<(EntityKey, LockMetadata)>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut expired: Vec<_> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, entry)| (key.clone(), entry.metadata.clone()))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(expired)
    }
}
