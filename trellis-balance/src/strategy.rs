//! Load-balancing strategies.
//!
//! Every strategy receives the already-filtered eligible candidate list
//! and returns the id of its pick; callers hold the registry lock, so
//! strategies may keep interior state without their own synchronization.
//!
//! # Strategies
//!
//! - `roundrobin`: counter modulo candidates
//! - `weighted`: smooth weighted round-robin (nginx style)
//! - `leastconn`: fewest active connections, EWMA tie-break
//! - `ewma`: lowest first-byte latency EWMA
//! - `ai-load`: composite queue/GPU/VRAM/latency/connection score
//! - `consistent-hash`: 160-point virtual ring over backend ids

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tracing::warn;

use crate::backend::Backend;

/// Strategy interface. `candidates` is non-empty and pre-filtered for
/// eligibility; the return value is a backend id out of that list.
pub trait Balancer: Send {
    fn name(&self) -> &'static str;
    fn select(&mut self, candidates: &[&Backend], key: &str) -> Option<String>;
}

/// Build a strategy by its config name; unknown names fall back to
/// round-robin with a warning.
pub fn create_strategy(name: &str) -> Box<dyn Balancer> {
    match name {
        "roundrobin" => Box::new(RoundRobin::default()),
        "weighted" => Box::new(WeightedRoundRobin::default()),
        "leastconn" => Box::new(LeastConnections),
        "ewma" => Box::new(LowestEwma),
        "ai-load" => Box::new(AiLoad::default()),
        "consistent-hash" => Box::new(ConsistentHash::default()),
        other => {
            warn!(strategy = other, "unknown strategy, using roundrobin");
            Box::new(RoundRobin::default())
        }
    }
}

// ============================================================================
// Round robin
// ============================================================================

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: usize,
}

impl Balancer for RoundRobin {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn select(&mut self, candidates: &[&Backend], _key: &str) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.counter % candidates.len();
        self.counter = self.counter.wrapping_add(1);
        Some(candidates[idx].id())
    }
}

// ============================================================================
// Smooth weighted round robin
// ============================================================================

/// Nginx-style smoothing: every pass each candidate gains its effective
/// weight, the max is picked and pays back the total. Produces the
/// classic interleaved sequence instead of weight-sized bursts.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    current: HashMap<String, i64>,
}

impl Balancer for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&mut self, candidates: &[&Backend], _key: &str) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let total: i64 = candidates.iter().map(|b| i64::from(b.weight)).sum();
        for b in candidates {
            *self.current.entry(b.id()).or_insert(0) += i64::from(b.weight);
        }
        let mut best_idx = 0usize;
        let mut best_weight = i64::MIN;
        for (i, b) in candidates.iter().enumerate() {
            let cur = self.current.get(&b.id()).copied().unwrap_or(0);
            if cur > best_weight {
                best_weight = cur;
                best_idx = i;
            }
        }
        let picked = candidates[best_idx].id();
        if let Some(cur) = self.current.get_mut(&picked) {
            *cur -= total;
        }
        // Drop state for backends no longer in rotation.
        if self.current.len() > candidates.len() * 2 {
            let live: Vec<String> = candidates.iter().map(|b| b.id()).collect();
            self.current.retain(|id, _| live.contains(id));
        }
        Some(picked)
    }
}

// ============================================================================
// Least connections
// ============================================================================

#[derive(Debug)]
pub struct LeastConnections;

impl Balancer for LeastConnections {
    fn name(&self) -> &'static str {
        "leastconn"
    }

    fn select(&mut self, candidates: &[&Backend], _key: &str) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.active_connections
                    .cmp(&b.active_connections)
                    .then_with(|| {
                        a.ewma_response_ms
                            .partial_cmp(&b.ewma_response_ms)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
            .map(|b| b.id())
    }
}

// ============================================================================
// Lowest EWMA response time
// ============================================================================

#[derive(Debug)]
pub struct LowestEwma;

impl Balancer for LowestEwma {
    fn name(&self) -> &'static str {
        "ewma"
    }

    fn select(&mut self, candidates: &[&Backend], _key: &str) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.ewma_response_ms
                    .partial_cmp(&b.ewma_response_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.active_connections.cmp(&b.active_connections))
            })
            .map(|b| b.id())
    }
}

// ============================================================================
// AI-load composite score
// ============================================================================

/// Minimizes `a*(queue/queue_scale) + b*gpu + c*(vram_used/vram_total) +
/// d*(ewma/baseline) + e*(active/cap)`; metrics a backend does not report
/// contribute zero.
#[derive(Debug)]
pub struct AiLoad {
    pub queue_coef: f64,
    pub gpu_coef: f64,
    pub vram_coef: f64,
    pub rt_coef: f64,
    pub conn_coef: f64,
    pub queue_scale: f64,
    pub rt_baseline_ms: f64,
    pub conn_cap: f64,
}

impl Default for AiLoad {
    fn default() -> Self {
        Self {
            queue_coef: 1.0,
            gpu_coef: 1.0,
            vram_coef: 0.5,
            rt_coef: 0.5,
            conn_coef: 0.5,
            queue_scale: 8.0,
            rt_baseline_ms: 100.0,
            conn_cap: 100.0,
        }
    }
}

impl AiLoad {
    fn score(&self, b: &Backend) -> f64 {
        let mut score = 0.0;
        if let Some(q) = b.queue_len {
            score += self.queue_coef * f64::from(q) / self.queue_scale;
        }
        if let Some(gpu) = b.gpu_util {
            score += self.gpu_coef * gpu;
        }
        if let (Some(used), Some(total)) = (b.vram_used_mb, b.vram_total_mb) {
            if total > 0 {
                score += self.vram_coef * f64::from(used) / f64::from(total);
            }
        }
        if b.ewma_response_ms > 0.0 {
            score += self.rt_coef * b.ewma_response_ms / self.rt_baseline_ms;
        }
        score += self.conn_coef * f64::from(b.active_connections) / self.conn_cap;
        score
    }
}

impl Balancer for AiLoad {
    fn name(&self) -> &'static str {
        "ai-load"
    }

    fn select(&mut self, candidates: &[&Backend], _key: &str) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                self.score(a)
                    .partial_cmp(&self.score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|b| b.id())
    }
}

// ============================================================================
// Consistent hash
// ============================================================================

/// 160 virtual nodes per backend on a u64 ring; the selection key hashes
/// to a point and walks clockwise to the first node. The ring is cached
/// and rebuilt only when the candidate set changes.
pub struct ConsistentHash {
    ring: Vec<(u64, String)>,
    members_fingerprint: u64,
}

const VNODES: usize = 160;

impl Default for ConsistentHash {
    fn default() -> Self {
        Self {
            ring: Vec::new(),
            members_fingerprint: 0,
        }
    }
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

impl ConsistentHash {
    fn rebuild(&mut self, candidates: &[&Backend]) {
        self.ring.clear();
        self.ring.reserve(candidates.len() * VNODES);
        for b in candidates {
            let id = b.id();
            for v in 0..VNODES {
                self.ring.push((hash_str(&format!("{id}#{v}")), id.clone()));
            }
        }
        self.ring.sort_by_key(|(point, _)| *point);
    }

    fn fingerprint(candidates: &[&Backend]) -> u64 {
        let mut hasher = DefaultHasher::new();
        for b in candidates {
            b.id().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Balancer for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent-hash"
    }

    fn select(&mut self, candidates: &[&Backend], key: &str) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let fp = Self::fingerprint(candidates);
        if fp != self.members_fingerprint || self.ring.is_empty() {
            self.rebuild(candidates);
            self.members_fingerprint = fp;
        }
        let point = hash_str(key);
        let idx = match self.ring.binary_search_by_key(&point, |(p, _)| *p) {
            Ok(i) => i,
            Err(i) if i == self.ring.len() => 0,
            Err(i) => i,
        };
        Some(self.ring[idx].1.clone())
    }
}
