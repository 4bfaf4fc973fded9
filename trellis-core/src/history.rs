//! Time-series history of process metrics.
//!
//! A sampler task snapshots the metrics every `sample_ms`, derives
//! per-interval rates (qps, backend error rate) and latency percentiles,
//! and keeps the points in a bounded ring. Optionally each point is also
//! appended as one JSON line to a persistence file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::stats::Metrics;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub sample_ms: u64,
    pub max_points: usize,
    /// JSONL append target; empty disables persistence.
    pub persist_path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            sample_ms: 1000,
            max_points: 3600,
            persist_path: None,
        }
    }
}

/// One sampled point.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Point {
    pub ts_ms: u64,
    pub active_connections: i64,
    pub total_requests: u64,
    pub backend_failures: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub qps: f64,
    pub backend_error_rate_interval: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub avg_ms: f64,
    pub rss_bytes: u64,
    pub fd_count: u32,
}

#[derive(Debug, Default)]
struct Ring {
    points: Vec<Point>,
    pos: usize,
    filled: bool,
}

#[derive(Debug, Default)]
struct SampleState {
    last_total: u64,
    last_failures: u64,
    last_at: Option<Instant>,
}

/// Bounded metric history with JSONL persistence.
pub struct HistoryStore {
    cfg: HistoryConfig,
    metrics: Arc<Metrics>,
    ring: Mutex<Ring>,
    sample_state: Mutex<SampleState>,
}

impl HistoryStore {
    pub fn new(cfg: HistoryConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            metrics,
            ring: Mutex::new(Ring::default()),
            sample_state: Mutex::new(SampleState::default()),
        })
    }

    /// Spawn the periodic sampler.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(store.cfg.sample_ms.max(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let point = store.sample_once();
                store.push(point.clone());
                if let Some(path) = &store.cfg.persist_path {
                    if let Ok(line) = serde_json::to_string(&point) {
                        let path = path.clone();
                        let write = tokio::task::spawn_blocking(move || {
                            use std::io::Write;
                            std::fs::OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(&path)
                                .and_then(|mut f| writeln!(f, "{line}"))
                        })
                        .await;
                        if !matches!(write, Ok(Ok(()))) {
                            warn!("history persistence write failed");
                        }
                    }
                }
            }
        })
    }

    /// Take one sample now (also used directly by tests).
    pub fn sample_once(&self) -> Point {
        let now = Instant::now();
        let total = self.metrics.total_requests();
        let failures = self.metrics.backend_failures();
        let lat = self.metrics.latency_summary();

        let mut state = self.sample_state.lock();
        let interval = state
            .last_at
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        let delta_total = total.saturating_sub(state.last_total);
        let delta_failures = failures.saturating_sub(state.last_failures);
        state.last_total = total;
        state.last_failures = failures;
        state.last_at = Some(now);
        drop(state);

        let qps = if interval > 0.0 {
            delta_total as f64 / interval
        } else {
            0.0
        };
        let err_rate = if delta_total > 0 {
            delta_failures as f64 / delta_total as f64
        } else {
            0.0
        };
        let (rss_bytes, fd_count) = process_usage();

        Point {
            ts_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            active_connections: self.metrics.active_connections(),
            total_requests: total,
            backend_failures: failures,
            bytes_in: self.metrics.bytes_in(),
            bytes_out: self.metrics.bytes_out(),
            qps,
            backend_error_rate_interval: err_rate,
            p50_ms: lat.p50,
            p90_ms: lat.p90,
            p99_ms: lat.p99,
            avg_ms: lat.avg,
            rss_bytes,
            fd_count,
        }
    }

    fn push(&self, point: Point) {
        let mut ring = self.ring.lock();
        if ring.points.len() < self.cfg.max_points {
            ring.points.push(point);
        } else {
            let pos = ring.pos % self.cfg.max_points;
            ring.points[pos] = point;
            ring.filled = true;
        }
        ring.pos = (ring.pos + 1) % self.cfg.max_points.max(1);
    }

    /// Points from the last `seconds`, oldest first.
    pub fn query_last_seconds(&self, seconds: u64) -> Vec<Point> {
        let cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(seconds.saturating_mul(1000));

        let ring = self.ring.lock();
        let mut ordered: Vec<Point> = if ring.filled {
            let split = ring.pos % self.cfg.max_points.max(1);
            ring.points[split..]
                .iter()
                .chain(ring.points[..split].iter())
                .cloned()
                .collect()
        } else {
            ring.points.clone()
        };
        ordered.retain(|p| p.ts_ms >= cutoff);
        ordered
    }

    pub fn points_json(&self, seconds: u64) -> String {
        json!({ "points": self.query_last_seconds(seconds) }).to_string()
    }

    /// min/max/avg of the headline series over the window.
    pub fn summary_json(&self, seconds: u64) -> String {
        let points = self.query_last_seconds(seconds);
        let series = |f: fn(&Point) -> f64| {
            let values: Vec<f64> = points.iter().map(f).collect();
            if values.is_empty() {
                json!({"min": 0.0, "max": 0.0, "avg": 0.0})
            } else {
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                json!({"min": min, "max": max, "avg": avg})
            }
        };
        json!({
            "seconds": seconds,
            "samples": points.len(),
            "qps": series(|p| p.qps),
            "active_connections": series(|p| p.active_connections as f64),
            "p99_ms": series(|p| p.p99_ms),
            "backend_error_rate": series(|p| p.backend_error_rate_interval),
        })
        .to_string()
    }
}

/// RSS and fd count from /proc, zeros elsewhere.
fn process_usage() -> (u64, u32) {
    #[cfg(target_os = "linux")]
    {
        let rss = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0);
        let fds = std::fs::read_dir("/proc/self/fd")
            .map(|d| d.count() as u32)
            .unwrap_or(0);
        (rss, fds)
    }
    #[cfg(not(target_os = "linux"))]
    {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_points: usize) -> Arc<HistoryStore> {
        HistoryStore::new(
            HistoryConfig {
                sample_ms: 100,
                max_points,
                persist_path: None,
            },
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_sample_derives_qps() {
        let s = store(10);
        let _ = s.sample_once();
        s.metrics.inc_total_requests();
        s.metrics.inc_total_requests();
        std::thread::sleep(Duration::from_millis(20));
        let p = s.sample_once();
        assert!(p.qps > 0.0);
        assert_eq!(p.total_requests, 2);
    }

    #[test]
    fn test_error_rate_interval() {
        let s = store(10);
        let _ = s.sample_once();
        s.metrics.inc_total_requests();
        s.metrics.inc_total_requests();
        s.metrics.inc_backend_failures();
        std::thread::sleep(Duration::from_millis(5));
        let p = s.sample_once();
        assert_eq!(p.backend_error_rate_interval, 0.5);
    }

    #[test]
    fn test_ring_bounded_and_ordered() {
        let s = store(3);
        for _ in 0..5 {
            let p = s.sample_once();
            s.push(p);
        }
        let points = s.query_last_seconds(3600);
        assert_eq!(points.len(), 3);
        assert!(points.windows(2).all(|w| w[0].ts_ms <= w[1].ts_ms));
    }

    #[test]
    fn test_query_window_filters() {
        let s = store(10);
        let mut old = s.sample_once();
        old.ts_ms = old.ts_ms.saturating_sub(120_000);
        s.push(old);
        let fresh = s.sample_once();
        s.push(fresh);
        assert_eq!(s.query_last_seconds(60).len(), 1);
        assert_eq!(s.query_last_seconds(300).len(), 2);
    }

    #[test]
    fn test_summary_json_shape() {
        let s = store(10);
        let p = s.sample_once();
        s.push(p);
        let summary: serde_json::Value = serde_json::from_str(&s.summary_json(60)).unwrap();
        assert_eq!(summary["samples"], 1);
        assert!(summary["qps"]["avg"].is_number());
    }
}
