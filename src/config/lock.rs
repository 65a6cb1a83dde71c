//! Lock backend configuration.

use serde::Deserialize;

/// Lock backend discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendType {
    /// In-process lock table (single process only).
    #[default]
    Memory,
    /// Redis-backed distributed locks.
    Redis,
}

/// Lock configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Backend discriminator.
    pub backend: LockBackendType,
    /// Redis connection URL (redis backend).
    pub redis_url: String,
    /// Prefix for all lock keys.
    pub key_prefix: String,
    /// How long to wait for a busy lock before failing the transaction.
    pub timeout_ms: u64,
    /// Delay between acquire attempts.
    pub poll_interval_ms: u64,
    /// How long an unreleased lock blocks others before it can be recovered.
    pub expiration_secs: u64,
    /// Interval of the background sweep over expired locks.
    pub recovery_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendType::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "promulgate".to_string(),
            timeout_ms: 10_000,
            poll_interval_ms: 10,
            expiration_secs: 60,
            recovery_interval_secs: 5,
        }
    }
}
