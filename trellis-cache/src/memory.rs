//! Bounded in-memory store: LRU with per-entry expiry.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::CacheResult;
use crate::traits::CacheStore;

struct EntryValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process cache store, bounded by entry count.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, EntryValue>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.expires_at > Instant::now() => Ok(Some(v.bytes.clone())),
            Some(_) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.entries.lock().put(
            key.to_string(),
            EntryValue {
                bytes: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new(10);
        store
            .set("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryStore::new(10);
        store
            .set("k", b"v".to_vec(), Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lru_bound() {
        let store = MemoryStore::new(2);
        for i in 0..5 {
            store
                .set(&format!("k{i}"), vec![i], Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("k4").await.unwrap(), Some(vec![4]));
        assert_eq!(store.get("k0").await.unwrap(), None);
    }
}
