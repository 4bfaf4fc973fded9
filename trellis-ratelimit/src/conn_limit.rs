//! Per-key connection limiter.
//!
//! Tracks active connections per key (client IP, user id, service name)
//! and refuses new ones past the cap. Keys with zero active connections
//! are pruned; if the map still outgrows `max_entries`, inactive keys are
//! evicted least-recently-active first. Keys holding live connections are
//! never evicted, so `release` stays balanced.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct ConnLimiterConfig {
    /// Maximum simultaneous connections per key; 0 disables the limiter.
    pub max_per_key: usize,
    /// Hard cap on tracked keys.
    pub max_entries: usize,
}

impl Default for ConnLimiterConfig {
    fn default() -> Self {
        Self {
            max_per_key: 0,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug)]
struct Slot {
    active: usize,
    last_active: Instant,
}

/// Thread-safe per-key connection counter.
#[derive(Debug)]
pub struct ConnLimiter {
    cfg: ConnLimiterConfig,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnLimiter {
    pub fn new(cfg: ConnLimiterConfig) -> Self {
        Self {
            cfg,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.max_per_key > 0
    }

    /// Claim a slot for `key`. Always succeeds when disabled.
    pub fn try_acquire(&self, key: &str) -> bool {
        if !self.enabled() {
            return true;
        }
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert(Slot {
            active: 0,
            last_active: now,
        });
        if slot.active >= self.cfg.max_per_key {
            slot.last_active = now;
            return false;
        }
        slot.active += 1;
        slot.last_active = now;

        if slots.len() > self.cfg.max_entries {
            Self::evict_inactive_locked(&mut slots, self.cfg.max_entries);
        }
        true
    }

    /// Return a slot previously claimed with `try_acquire`.
    pub fn release(&self, key: &str) {
        if !self.enabled() {
            return;
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.active = slot.active.saturating_sub(1);
            slot.last_active = Instant::now();
            if slot.active == 0 {
                slots.remove(key);
            }
        }
    }

    /// Active connections for `key`.
    pub fn active(&self, key: &str) -> usize {
        self.slots.lock().get(key).map(|s| s.active).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_inactive_locked(slots: &mut HashMap<String, Slot>, cap: usize) {
        while slots.len() > cap {
            let victim = slots
                .iter()
                .filter(|(_, s)| s.active == 0)
                .min_by_key(|(_, s)| s.last_active)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    slots.remove(&k);
                }
                None => break, // everything is live; nothing evictable
            }
        }
    }
}
