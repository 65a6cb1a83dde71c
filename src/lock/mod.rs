//! Per-entity distributed locking.
//!
//! This module contains:
//! - `LockBackend` trait: the external mutual-exclusion primitive
//! - `LockCoordinator`: sorted multi-key acquisition, stale-lock recovery, release
//! - Implementations: in-memory, Redis
//!
//! A lock whose holder crashed is never deleted. It passively expires and the next
//! acquirer observes it as `LockOutcome::Recovered`, taking it over atomically and
//! receiving the previous holder's metadata so the abandoned operation can be
//! republished.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{LockBackendType, LockConfig};
use crate::entity::{Attribution, EntityKey, OperationKind};
use crate::recovery::RecoveryError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryLockBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockBackend;

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors that can occur while locking.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock unavailable: {0}")]
    Unavailable(EntityKey),

    #[error("Lock lost before it could be extended: {0}")]
    Lost(EntityKey),

    #[error("Lock backend failure: {0}")]
    Backend(String),

    #[error("Lock metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),
}

/// Data stored alongside a held lock, enough to rebuild the operation if the
/// holder never releases it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMetadata {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(rename = "payload_attributes", default)]
    pub attribution: Attribution,
    #[serde(rename = "class")]
    pub entity_type: String,
    #[serde(rename = "id")]
    pub entity_id: String,
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// The lock was free and is now held.
    Acquired,
    /// Another live holder owns the lock.
    Unavailable,
    /// The previous holder's claim expired without release; the lock is now held
    /// and the previous metadata is returned.
    Recovered(LockMetadata),
}

/// Timing parameters for acquisition and holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long to keep polling a busy lock before giving up.
    pub timeout: Duration,
    /// Delay between acquire attempts.
    pub poll_interval: Duration,
    /// How long a claim stays valid without release.
    pub expiration: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            expiration: Duration::from_secs(60),
        }
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            expiration: Duration::from_secs(config.expiration_secs),
        }
    }
}

/// A claim on an entity key, identified by a holder token.
///
/// Dropping a `HeldLock` does not release it; an unreleased lock expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub key: EntityKey,
    pub token: String,
}

impl HeldLock {
    /// A fresh claim with a unique holder token.
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// The external mutual-exclusion primitive.
///
/// Ownership checks use the holder token: `extend` and `release` only affect a
/// lock still owned by the given token.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Single, non-blocking acquire attempt.
    ///
    /// Taking over an expired claim must be atomic with reading its metadata.
    async fn try_acquire(
        &self,
        key: &EntityKey,
        token: &str,
        metadata: &LockMetadata,
        expiration: Duration,
    ) -> Result<LockOutcome>;

    /// Push the expiration of an owned lock forward. Returns false if not owned.
    async fn extend(&self, key: &EntityKey, token: &str, expiration: Duration) -> Result<bool>;

    /// Release an owned lock. Returns false if not owned (already released or taken over).
    async fn release(&self, key: &EntityKey, token: &str) -> Result<bool>;

    /// Turn an owned lock back into an already-expired claim carrying `metadata`,
    /// so the next acquirer or sweep recovers it. Returns false if not owned.
    async fn relinquish(&self, key: &EntityKey, token: &str, metadata: &LockMetadata) -> Result<bool>;

    /// Locks whose expiration elapsed without release.
    async fn expired(&self) -> Result<Vec<(EntityKey, LockMetadata)>>;
}

/// Called synchronously during acquisition when a stale lock is taken over.
#[async_trait]
pub trait RecoveryHandler: Send {
    async fn recover(
        &mut self,
        key: &EntityKey,
        stale: LockMetadata,
    ) -> std::result::Result<(), RecoveryError>;
}

/// Acquires, recovers and releases per-entity locks.
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    options: LockOptions,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn LockBackend>, options: LockOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire a single lock, polling until it is free or the timeout elapses.
    ///
    /// `Unavailable` is only returned once the timeout has elapsed.
    pub async fn acquire(&self, lock: &HeldLock, metadata: &LockMetadata) -> Result<LockOutcome> {
        let deadline = Instant::now() + self.options.timeout;

        loop {
            let outcome = self
                .backend
                .try_acquire(&lock.key, &lock.token, metadata, self.options.expiration)
                .await?;

            match outcome {
                LockOutcome::Unavailable if Instant::now() < deadline => {
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                outcome => return Ok(outcome),
            }
        }
    }

    /// Acquire every requested key in ascending key order.
    ///
    /// Duplicate keys are locked once, with the first request's metadata. On any
    /// failure every lock acquired by this call is released before returning,
    /// except a taken-over lock whose recovery failed: that one is handed back
    /// still carrying the abandoned operation.
    pub async fn acquire_all(
        &self,
        requests: Vec<(EntityKey, LockMetadata)>,
        recovery: &mut (dyn RecoveryHandler + '_),
    ) -> Result<Vec<HeldLock>> {
        let mut sorted: BTreeMap<EntityKey, LockMetadata> = BTreeMap::new();
        for (key, metadata) in requests {
            sorted.entry(key).or_insert(metadata);
        }

        let mut held: Vec<HeldLock> = Vec::with_capacity(sorted.len());

        for (key, metadata) in sorted {
            let lock = HeldLock::new(key);

            let outcome = match self.acquire(&lock, &metadata).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release_all(&held).await;
                    return Err(e);
                }
            };

            match outcome {
                LockOutcome::Acquired => {
                    debug!(key = %lock.key, "Lock acquired");
                    held.push(lock);
                }
                LockOutcome::Unavailable => {
                    debug!(key = %lock.key, "Lock unavailable, releasing partial set");
                    self.release_all(&held).await;
                    return Err(LockError::Unavailable(lock.key));
                }
                LockOutcome::Recovered(stale) => {
                    warn!(
                        key = %lock.key,
                        operation = %stale.kind,
                        entity_type = %stale.entity_type,
                        entity_id = %stale.entity_id,
                        "Recovering expired lock"
                    );
                    if let Err(e) = recovery.recover(&lock.key, stale.clone()).await {
                        self.relinquish(&lock, &stale).await;
                        self.release_all(&held).await;
                        return Err(e.into());
                    }

                    match self
                        .backend
                        .extend(&lock.key, &lock.token, self.options.expiration)
                        .await
                    {
                        Ok(true) => held.push(lock),
                        Ok(false) => {
                            self.release_all(&held).await;
                            return Err(LockError::Lost(lock.key));
                        }
                        Err(e) => {
                            self.relinquish(&lock, &stale).await;
                            self.release_all(&held).await;
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(held)
    }

    /// Release one lock. Returns false if it was no longer owned.
    pub async fn release(&self, lock: &HeldLock) -> Result<bool> {
        let released = self.backend.release(&lock.key, &lock.token).await?;
        if released {
            debug!(key = %lock.key, "Lock released");
        } else {
            debug!(key = %lock.key, "Lock no longer owned, nothing to release");
        }
        Ok(released)
    }

    /// Release a batch of locks. Failures are logged; unreleased locks expire.
    pub async fn release_all(&self, locks: &[HeldLock]) {
        for lock in locks {
            if let Err(e) = self.release(lock).await {
                warn!(key = %lock.key, error = %e, "Failed to release lock, it will expire");
            }
        }
    }

    /// Hand a taken-over lock back with the abandoned holder's metadata, already
    /// expired. Failures are logged; the claim then expires with our metadata.
    async fn relinquish(&self, lock: &HeldLock, stale: &LockMetadata) {
        match self.backend.relinquish(&lock.key, &lock.token, stale).await {
            Ok(true) => {
                warn!(key = %lock.key, "Recovery aborted, abandoned operation left for the next acquirer");
            }
            Ok(false) => {
                warn!(key = %lock.key, "Recovery aborted and lock no longer owned");
            }
            Err(e) => {
                error!(key = %lock.key, error = %e, "Failed to hand back abandoned operation");
            }
        }
    }

    /// Locks whose holders never released them.
    pub async fn expired(&self) -> Result<Vec<(EntityKey, LockMetadata)>> {
        self.backend.expired().await
    }
}

/// Initialize the lock backend selected by configuration.
pub async fn init_lock_backend(config: &LockConfig) -> Result<Arc<dyn LockBackend>> {
    match config.backend {
        LockBackendType::Memory => {
            info!(backend = "memory", "Lock backend initialized");
            Ok(Arc::new(MemoryLockBackend::new()))
        }
        LockBackendType::Redis => {
            #[cfg(feature = "redis")]
            {
                let backend = RedisLockBackend::connect(&config.redis_url, &config.key_prefix).await?;
                info!(backend = "redis", "Lock backend initialized");
                Ok(Arc::new(backend))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(LockError::Backend(
                    "Redis locking requires the 'redis' feature. Rebuild with --features redis"
                        .to_string(),
                ))
            }
        }
    }
}
