// Cache configuration from the `[cache]` section.

/// Settings for the response cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// "memory" or "memcache".
    pub backend: String,
    pub host: String,
    pub port: u16,
    pub ttl_sec: u64,
    /// Per-value size cap; larger responses are never stored.
    pub max_value_bytes: usize,
    /// Operation timeout against an external backend.
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "memory".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11211,
            ttl_sec: 60,
            max_value_bytes: 256 * 1024,
            timeout_ms: 200,
        }
    }
}

impl CacheConfig {
    /// memcached URL for the `memcache` client.
    pub fn memcached_url(&self) -> String {
        format!("memcache://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcached_url() {
        let cfg = CacheConfig {
            host: "cache.local".into(),
            port: 11333,
            ..Default::default()
        };
        assert_eq!(cfg.memcached_url(), "memcache://cache.local:11333");
    }
}
