// The store abstraction every cache backend implements.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

/// A key/value store with per-entry TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Best-effort removal; stores may ignore unknown keys.
    async fn delete(&self, key: &str) -> CacheResult<()>;
}
