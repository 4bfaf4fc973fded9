//! AIMD congestion control over in-flight upstream requests.
//!
//! The window is the number of upstream requests allowed concurrently.
//! Additive increase: after a full window of acknowledged completions the
//! window grows by `additive_increase`. Multiplicative decrease: a failed
//! completion or an admission drop shrinks it to `floor(cwnd * beta)`.
//! Invariants: `min <= cwnd <= max`, `0 <= inflight <= cwnd`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CongestionConfig {
    pub enabled: bool,
    pub initial_window: usize,
    pub min_window: usize,
    pub max_window: usize,
    /// Window growth per full window of acks.
    pub additive_increase: usize,
    /// Shrink factor on loss; cwnd = max(min, floor(cwnd * beta)).
    pub beta: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_window: 64,
            min_window: 1,
            max_window: 1024,
            additive_increase: 1,
            beta: 0.7,
        }
    }
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionStats {
    pub cwnd: usize,
    pub inflight: usize,
    pub acks: u64,
    pub losses: u64,
}

#[derive(Debug)]
struct Window {
    cwnd: usize,
    inflight: usize,
    ack_counter: usize,
}

/// Thread-safe AIMD controller.
#[derive(Debug)]
pub struct CongestionControl {
    cfg: CongestionConfig,
    window: Mutex<Window>,
    acks: AtomicU64,
    losses: AtomicU64,
}

impl CongestionControl {
    pub fn new(cfg: CongestionConfig) -> Self {
        let initial = cfg
            .initial_window
            .clamp(cfg.min_window.max(1), cfg.max_window.max(1));
        Self {
            window: Mutex::new(Window {
                cwnd: initial,
                inflight: 0,
                ack_counter: 0,
            }),
            acks: AtomicU64::new(0),
            losses: AtomicU64::new(0),
            cfg,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Claim one in-flight slot; false when the window is full.
    pub fn try_acquire(&self) -> bool {
        if !self.cfg.enabled {
            return true;
        }
        let mut w = self.window.lock();
        if w.inflight >= w.cwnd {
            return false;
        }
        w.inflight += 1;
        true
    }

    /// Complete one request claimed via `try_acquire`.
    pub fn on_complete(&self, success: bool) {
        if !self.cfg.enabled {
            return;
        }
        let mut w = self.window.lock();
        w.inflight = w.inflight.saturating_sub(1);
        if success {
            self.acks.fetch_add(1, Ordering::Relaxed);
            w.ack_counter += 1;
            if w.ack_counter >= w.cwnd {
                w.ack_counter = 0;
                w.cwnd = (w.cwnd + self.cfg.additive_increase).min(self.cfg.max_window);
            }
        } else {
            self.losses.fetch_add(1, Ordering::Relaxed);
            self.shrink_locked(&mut w);
        }
    }

    /// Congestion signal without an acquired slot (load shed).
    pub fn on_drop(&self) {
        if !self.cfg.enabled {
            return;
        }
        self.losses.fetch_add(1, Ordering::Relaxed);
        let mut w = self.window.lock();
        self.shrink_locked(&mut w);
    }

    pub fn stats(&self) -> CongestionStats {
        let w = self.window.lock();
        CongestionStats {
            cwnd: w.cwnd,
            inflight: w.inflight,
            acks: self.acks.load(Ordering::Relaxed),
            losses: self.losses.load(Ordering::Relaxed),
        }
    }

    fn shrink_locked(&self, w: &mut Window) {
        let shrunk = (w.cwnd as f64 * self.cfg.beta).floor() as usize;
        w.cwnd = shrunk.max(self.cfg.min_window);
        w.ack_counter = 0;
        debug!(cwnd = w.cwnd, inflight = w.inflight, "congestion window shrunk");
    }
}
