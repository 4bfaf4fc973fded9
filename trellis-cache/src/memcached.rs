//! memcached store.
//!
//! The `memcache` crate is synchronous, so every operation hops through
//! `spawn_blocking` behind a tokio mutex. The client connects lazily on
//! first use and reconnects after an error by dropping the handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::CacheStore;

pub struct MemcachedStore {
    client: Arc<Mutex<Option<memcache::Client>>>,
    url: String,
    op_timeout: Duration,
}

impl MemcachedStore {
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            client: Arc::new(Mutex::new(None)),
            url: cfg.memcached_url(),
            op_timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
        }
    }

    /// Run `op` against the (lazily connected) client on the blocking
    /// pool, bounded by the configured operation timeout.
    async fn with_client<T, F>(&self, op: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> Result<T, memcache::MemcacheError> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let url = self.url.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = client.blocking_lock();
            if guard.is_none() {
                let connected = memcache::connect(url.as_str())
                    .map_err(|e| CacheError::Connection(e.to_string()))?;
                *guard = Some(connected);
            }
            let Some(handle) = guard.as_ref() else {
                return Err(CacheError::Connection("memcached unavailable".into()));
            };
            match op(handle) {
                Ok(v) => Ok(v),
                Err(e) => {
                    // Drop the handle so the next call reconnects.
                    *guard = None;
                    Err(CacheError::Operation(e.to_string()))
                }
            }
        });

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CacheError::Operation(join_err.to_string())),
            Err(_) => {
                debug!(url = %self.url, "memcached operation timed out");
                Err(CacheError::Timeout)
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemcachedStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_client(move |c| c.get::<Vec<u8>>(&key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let key = key.to_string();
        let exp = ttl.as_secs().min(u64::from(u32::MAX)) as u32;
        self.with_client(move |c| c.set(&key, &value[..], exp)).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let key = key.to_string();
        self.with_client(move |c| c.delete(&key).map(|_| ())).await
    }
}
