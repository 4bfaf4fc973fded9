//! Trellis Response Cache
//!
//! Opt-in caching of upstream responses. The store is pluggable behind
//! [`CacheStore`]: a bounded in-memory LRU for single-instance setups and
//! a memcached client for shared deployments.
//!
//! Values travel as `status\ncontent-type\nbody` (see [`StoredResponse`]),
//! so any store only ever sees opaque bytes. The session engine stores
//! only identity-coded `200 OK` responses that finished transform mode,
//! and only under the configured per-value size cap.

mod config;
mod error;
mod memcached;
mod memory;
mod traits;
mod value;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use memcached::MemcachedStore;
pub use memory::MemoryStore;
pub use traits::CacheStore;
pub use value::StoredResponse;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

/// The facade the session engine talks to: key/value plus policy
/// (TTL, size cap, error swallowing - cache failures never fail requests).
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    max_value_bytes: usize,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, cfg: &CacheConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(cfg.ttl_sec),
            max_value_bytes: cfg.max_value_bytes,
        }
    }

    /// Build the configured store. Memory needs no I/O; memcached connects
    /// lazily on first use.
    pub fn from_config(cfg: &CacheConfig) -> Self {
        let store: Arc<dyn CacheStore> = match cfg.backend.as_str() {
            "memcache" | "memcached" => Arc::new(MemcachedStore::new(cfg)),
            _ => Arc::new(MemoryStore::new(4096)),
        };
        Self::new(store, cfg)
    }

    pub async fn lookup(&self, key: &str) -> Option<StoredResponse> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => StoredResponse::decode(&bytes),
            Ok(None) => None,
            Err(err) => {
                debug!(%key, %err, "cache lookup failed");
                None
            }
        }
    }

    /// Store a finalized response; oversized values are skipped silently.
    pub async fn store(&self, key: &str, response: &StoredResponse) {
        let encoded = response.encode();
        if encoded.len() > self.max_value_bytes {
            debug!(%key, size = encoded.len(), "cache value over size cap, skipped");
            return;
        }
        if let Err(err) = self.store.set(key, encoded, self.ttl).await {
            warn!(%key, %err, "cache store failed");
        }
    }
}
