//! Per-key token bucket map.
//!
//! One bucket per arbitrary string key (client IP, request path). The map
//! is bounded two ways: entries idle past `idle` are dropped during an
//! amortized cleanup pass (every `cleanup_every` calls), and when the map
//! still exceeds `max_entries` the least-recently-active entries are
//! evicted outright.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Limits for one keyed bucket map.
#[derive(Debug, Clone)]
pub struct KeyedLimiterConfig {
    /// Tokens per second per key; <= 0 disables the limiter.
    pub qps: f64,
    /// Burst per key; <= 0 defaults to `qps`.
    pub burst: f64,
    /// Entries idle longer than this may be removed.
    pub idle: Duration,
    /// Hard cap on map size.
    pub max_entries: usize,
    /// Run the cleanup pass every N `allow` calls.
    pub cleanup_every: usize,
}

impl Default for KeyedLimiterConfig {
    fn default() -> Self {
        Self {
            qps: 0.0,
            burst: 0.0,
            idle: Duration::from_secs(60),
            max_entries: 10_000,
            cleanup_every: 256,
        }
    }
}

#[derive(Debug)]
struct Entry {
    tokens: f64,
    last_refill: Instant,
    last_active: Instant,
}

impl Entry {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_active: now,
        }
    }

    fn allow_at(&mut self, now: Instant, rate: f64, capacity: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
        self.last_active = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
struct MapState {
    entries: HashMap<String, Entry>,
    calls: usize,
}

/// Thread-safe per-key token bucket limiter.
#[derive(Debug)]
pub struct KeyedLimiter {
    cfg: KeyedLimiterConfig,
    capacity: f64,
    state: Mutex<MapState>,
}

impl KeyedLimiter {
    pub fn new(cfg: KeyedLimiterConfig) -> Self {
        let capacity = if cfg.burst > 0.0 { cfg.burst } else { cfg.qps };
        Self {
            cfg,
            capacity,
            state: Mutex::new(MapState::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.qps > 0.0
    }

    /// Consume one token for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(Instant::now(), key)
    }

    pub fn allow_at(&self, now: Instant, key: &str) -> bool {
        if !self.enabled() {
            return true;
        }
        let mut state = self.state.lock();
        state.calls += 1;
        if self.cfg.cleanup_every > 0 && state.calls % self.cfg.cleanup_every == 0 {
            self.cleanup_locked(&mut state, now);
        }

        let capacity = self.capacity;
        let rate = self.cfg.qps;
        let allowed = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(capacity, now))
            .allow_at(now, rate, capacity);

        if state.entries.len() > self.cfg.max_entries {
            self.enforce_cap_locked(&mut state);
        }
        allowed
    }

    /// Current number of tracked keys.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cleanup_locked(&self, state: &mut MapState, now: Instant) {
        let idle = self.cfg.idle;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| now.saturating_duration_since(e.last_active) <= idle);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, remaining = state.entries.len(), "rate limiter cleanup");
        }
    }

    /// Evict least-recently-active entries until the cap holds.
    fn enforce_cap_locked(&self, state: &mut MapState) {
        while state.entries.len() > self.cfg.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_active)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    state.entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(qps: f64, burst: f64, max_entries: usize) -> KeyedLimiter {
        KeyedLimiter::new(KeyedLimiterConfig {
            qps,
            burst,
            idle: Duration::from_secs(1),
            max_entries,
            cleanup_every: 4,
        })
    }

    #[test]
    fn test_per_key_isolation() {
        let lim = limiter(1.0, 2.0, 100);
        let now = Instant::now();
        assert!(lim.allow_at(now, "a"));
        assert!(lim.allow_at(now, "a"));
        assert!(!lim.allow_at(now, "a"));
        // A different key has its own bucket.
        assert!(lim.allow_at(now, "b"));
    }

    #[test]
    fn test_disabled_allows_all() {
        let lim = limiter(0.0, 0.0, 2);
        for i in 0..100 {
            assert!(lim.allow(&format!("k{i}")));
        }
        assert_eq!(lim.len(), 0);
    }

    #[test]
    fn test_map_size_bounded() {
        let lim = limiter(10.0, 10.0, 8);
        let now = Instant::now();
        for i in 0..100 {
            lim.allow_at(now + Duration::from_millis(i), &format!("key{i}"));
            assert!(lim.len() <= 8, "size {} exceeded cap", lim.len());
        }
    }

    #[test]
    fn test_lru_eviction_keeps_recent() {
        let lim = limiter(10.0, 10.0, 2);
        let t0 = Instant::now();
        lim.allow_at(t0, "old");
        lim.allow_at(t0 + Duration::from_millis(10), "mid");
        lim.allow_at(t0 + Duration::from_millis(20), "new");
        assert_eq!(lim.len(), 2);
        // "old" was evicted; a fresh bucket admits immediately.
        assert!(lim.allow_at(t0 + Duration::from_millis(30), "new"));
    }

    #[test]
    fn test_idle_cleanup() {
        let lim = limiter(10.0, 10.0, 100);
        let t0 = Instant::now();
        lim.allow_at(t0, "stale");
        // Advance past idle and trigger the amortized pass (every 4 calls).
        let later = t0 + Duration::from_secs(5);
        for i in 0..4 {
            lim.allow_at(later, &format!("fresh{i}"));
        }
        assert!(lim.len() <= 4);
        let state = lim.state.lock();
        assert!(!state.entries.contains_key("stale"));
    }

    #[test]
    fn test_refill() {
        let lim = limiter(2.0, 2.0, 10);
        let t0 = Instant::now();
        assert!(lim.allow_at(t0, "k"));
        assert!(lim.allow_at(t0, "k"));
        assert!(!lim.allow_at(t0, "k"));
        assert!(lim.allow_at(t0 + Duration::from_secs(1), "k"));
    }
}
