//! Process-wide metrics.
//!
//! One `Metrics` object is created at startup and injected into every
//! component that records; nothing here is a global. Counters are
//! relaxed atomics; the latency ring and business counters sit behind a
//! mutex and are only touched once per request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::json;

use trellis_balance::BackendSnapshot;

/// Sliding latency window size.
const LATENCY_RING: usize = 1024;
/// Bound on per-method/path/model counter maps.
const MAX_BUSINESS_KEYS: usize = 1024;
/// `/stats` JSON cache lifetime, milliseconds.
const JSON_CACHE_MS: u128 = 100;

#[derive(Debug, Default)]
struct Inner {
    latencies_ms: Vec<f64>,
    ring_pos: usize,
    method_counts: HashMap<String, u64>,
    path_counts: HashMap<String, u64>,
    model_counts: HashMap<String, u64>,
    cached_json: String,
    cached_at: Option<Instant>,
}

/// Counters and distributions for `/stats` and the history sampler.
#[derive(Debug)]
pub struct Metrics {
    total_requests: AtomicU64,
    active_connections: AtomicI64,
    backend_failures: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    udp_rx_drops: AtomicU64,
    ddos_drops: AtomicU64,
    started_unix_ms: u64,
    inner: Mutex<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let started_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            total_requests: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            backend_failures: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            udp_rx_drops: AtomicU64::new(0),
            ddos_drops: AtomicU64::new(0),
            started_unix_ms,
            inner: Mutex::new(Inner::default()),
        }
    }

    #[inline]
    pub fn inc_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn conn_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn conn_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inc_backend_failures(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn backend_failures(&self) -> u64 {
        self.backend_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_udp_rx_drops(&self, n: u64) {
        self.udp_rx_drops.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_ddos_drops(&self, n: u64) {
        self.ddos_drops.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn ddos_drops(&self) -> u64 {
        self.ddos_drops.load(Ordering::Relaxed)
    }

    pub fn record_latency_ms(&self, ms: f64) {
        let mut inner = self.inner.lock();
        if inner.latencies_ms.len() < LATENCY_RING {
            inner.latencies_ms.push(ms);
        } else {
            let pos = inner.ring_pos % LATENCY_RING;
            inner.latencies_ms[pos] = ms;
        }
        inner.ring_pos = inner.ring_pos.wrapping_add(1);
    }

    pub fn record_method(&self, method: &str) {
        Self::bump(&mut self.inner.lock().method_counts, method);
    }

    pub fn record_path(&self, path: &str) {
        Self::bump(&mut self.inner.lock().path_counts, path);
    }

    pub fn record_model(&self, model: &str) {
        Self::bump(&mut self.inner.lock().model_counts, model);
    }

    fn bump(map: &mut HashMap<String, u64>, key: &str) {
        if map.len() >= MAX_BUSINESS_KEYS && !map.contains_key(key) {
            return;
        }
        *map.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Latency percentiles over the sliding window.
    pub fn latency_summary(&self) -> LatencySummary {
        let inner = self.inner.lock();
        LatencySummary::from_samples(&inner.latencies_ms)
    }

    /// Full JSON snapshot; recomputed at most every 100 ms.
    pub fn to_json(&self, backends: &[BackendSnapshot]) -> String {
        {
            let inner = self.inner.lock();
            if let Some(at) = inner.cached_at {
                if at.elapsed().as_millis() < JSON_CACHE_MS && !inner.cached_json.is_empty() {
                    return inner.cached_json.clone();
                }
            }
        }
        let rendered = self.render_json(backends);
        let mut inner = self.inner.lock();
        inner.cached_json = rendered.clone();
        inner.cached_at = Some(Instant::now());
        rendered
    }

    fn render_json(&self, backends: &[BackendSnapshot]) -> String {
        let lat = self.latency_summary();
        let inner = self.inner.lock();
        json!({
            "started_unix_ms": self.started_unix_ms,
            "total_requests": self.total_requests(),
            "active_connections": self.active_connections(),
            "backend_failures": self.backend_failures(),
            "bytes_in": self.bytes_in(),
            "bytes_out": self.bytes_out(),
            "udp_rx_drops": self.udp_rx_drops.load(Ordering::Relaxed),
            "ddos_drops": self.ddos_drops(),
            "latency_ms": {
                "p50": lat.p50, "p90": lat.p90, "p99": lat.p99, "avg": lat.avg,
            },
            "methods": &inner.method_counts,
            "paths": &inner.path_counts,
            "models": &inner.model_counts,
            "backends": backends,
        })
        .to_string()
    }
}

/// Percentiles of the latency window; zeros when empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub avg: f64,
}

impl LatencySummary {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |q: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        Self {
            p50: pick(0.50),
            p90: pick(0.90),
            p99: pick(0.99),
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.inc_total_requests();
        m.inc_total_requests();
        m.conn_opened();
        m.add_bytes_in(100);
        m.add_bytes_out(50);
        assert_eq!(m.total_requests(), 2);
        assert_eq!(m.active_connections(), 1);
        assert_eq!(m.bytes_in(), 100);
        assert_eq!(m.bytes_out(), 50);
        m.conn_closed();
        assert_eq!(m.active_connections(), 0);
    }

    #[test]
    fn test_latency_percentiles() {
        let m = Metrics::new();
        for i in 1..=100 {
            m.record_latency_ms(f64::from(i));
        }
        let s = m.latency_summary();
        assert!((s.p50 - 50.0).abs() <= 1.0);
        assert!((s.p90 - 90.0).abs() <= 1.0);
        assert!((s.p99 - 99.0).abs() <= 1.0);
        assert!((s.avg - 50.5).abs() <= 0.5);
    }

    #[test]
    fn test_latency_ring_wraps() {
        let m = Metrics::new();
        for _ in 0..(LATENCY_RING * 2) {
            m.record_latency_ms(1.0);
        }
        assert_eq!(m.latency_summary().avg, 1.0);
    }

    #[test]
    fn test_business_maps_bounded() {
        let m = Metrics::new();
        for i in 0..(MAX_BUSINESS_KEYS + 100) {
            m.record_path(&format!("/p{i}"));
        }
        assert!(m.inner.lock().path_counts.len() <= MAX_BUSINESS_KEYS);
        // Known keys still count past the cap.
        m.record_path("/p1");
        assert_eq!(m.inner.lock().path_counts["/p1"], 2);
    }

    #[test]
    fn test_json_contains_counters() {
        let m = Metrics::new();
        m.inc_total_requests();
        let json = m.to_json(&[]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["total_requests"], 1);
        assert!(parsed["backends"].as_array().unwrap().is_empty());
    }
}
