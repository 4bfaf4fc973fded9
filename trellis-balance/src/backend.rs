//! Per-backend state.

use serde::Serialize;

/// Address of one upstream origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub ip: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Canonical backend id, `ip:port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Parse an `ip:port` id.
    pub fn parse(id: &str) -> Option<Self> {
        let (ip, port) = id.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if ip.is_empty() || port == 0 {
            return None;
        }
        Some(Self::new(ip, port))
    }
}

impl std::fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// EWMA smoothing for first-byte response times.
const EWMA_ALPHA: f64 = 0.3;
/// Response-time baseline for weight adjustment, milliseconds.
const WEIGHT_RT_BASELINE_MS: f64 = 50.0;
/// Queue-length scale for weight adjustment.
const WEIGHT_QUEUE_SCALE: f64 = 8.0;

/// One upstream origin and everything the balancer knows about it.
#[derive(Debug, Clone)]
pub struct Backend {
    pub addr: BackendAddr,
    pub base_weight: u32,
    /// Effective weight; derived from `base_weight` when auto-adjust is
    /// on, never above it and never below 1.
    pub weight: u32,
    pub healthy: bool,
    /// Admin drain flag.
    pub online: bool,
    /// Ineligible until the warmup probe succeeds.
    pub warmup_pending: bool,

    pub active_connections: u32,
    /// First-byte latency EWMA, milliseconds.
    pub ewma_response_ms: f64,
    pub failures: u64,
    pub successes: u64,

    // External load metrics, best-effort.
    pub queue_len: Option<u32>,
    /// GPU utilization in [0, 1].
    pub gpu_util: Option<f64>,
    pub vram_used_mb: Option<u32>,
    pub vram_total_mb: Option<u32>,

    // AI readiness, tri-state: absent until a checker reports it.
    pub ai_ready_present: bool,
    pub ai_ready: bool,
    pub model_loaded: Option<bool>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
}

impl Backend {
    pub fn new(addr: BackendAddr, weight: u32) -> Self {
        let weight = weight.max(1);
        Self {
            addr,
            base_weight: weight,
            weight,
            healthy: true,
            online: true,
            warmup_pending: false,
            active_connections: 0,
            ewma_response_ms: 0.0,
            failures: 0,
            successes: 0,
            queue_len: None,
            gpu_util: None,
            vram_used_mb: None,
            vram_total_mb: None,
            ai_ready_present: false,
            ai_ready: true,
            model_loaded: None,
            model_name: None,
            model_version: None,
        }
    }

    pub fn id(&self) -> String {
        self.addr.id()
    }

    /// Selection admits only eligible backends.
    pub fn is_eligible(&self) -> bool {
        self.online && self.healthy && !self.warmup_pending && (!self.ai_ready_present || self.ai_ready)
    }

    /// True when this backend advertises `model` loaded.
    pub fn serves_model(&self, model: &str) -> bool {
        self.model_loaded == Some(true) && self.model_name.as_deref() == Some(model)
    }

    pub fn serves_model_version(&self, model: &str, version: &str) -> bool {
        self.serves_model(model) && self.model_version.as_deref() == Some(version)
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.failures + self.successes;
        if total == 0 {
            0.0
        } else {
            self.failures as f64 / total as f64
        }
    }

    pub fn record_response_ms(&mut self, ms: f64) {
        self.successes += 1;
        self.ewma_response_ms = if self.ewma_response_ms == 0.0 {
            ms
        } else {
            self.ewma_response_ms * (1.0 - EWMA_ALPHA) + ms * EWMA_ALPHA
        };
    }

    /// Effective weight under pressure: `clamp(base * f, 1, base)` where
    /// `f` shrinks with error rate, response time, queue depth and GPU
    /// utilization.
    pub fn recompute_weight(&mut self) {
        let mut f = (1.0 - self.error_rate()).clamp(0.05, 1.0);
        if self.ewma_response_ms > 0.0 {
            f *= WEIGHT_RT_BASELINE_MS / (WEIGHT_RT_BASELINE_MS + self.ewma_response_ms);
        }
        if let Some(q) = self.queue_len {
            f *= WEIGHT_QUEUE_SCALE / (WEIGHT_QUEUE_SCALE + f64::from(q));
        }
        if let Some(gpu) = self.gpu_util {
            f *= 1.0 - 0.5 * gpu.clamp(0.0, 1.0);
        }
        let effective = (f64::from(self.base_weight) * f).round() as u32;
        self.weight = effective.clamp(1, self.base_weight);
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id(),
            healthy: self.healthy,
            online: self.online,
            warmup_pending: self.warmup_pending,
            ai_ready_present: self.ai_ready_present,
            ai_ready: self.ai_ready,
            weight: self.weight,
            base_weight: self.base_weight,
            active_connections: self.active_connections,
            ewma_response_ms: self.ewma_response_ms,
            failures: self.failures,
            successes: self.successes,
            error_rate: self.error_rate(),
            queue_len: self.queue_len,
            gpu_util: self.gpu_util,
            vram_used_mb: self.vram_used_mb,
            vram_total_mb: self.vram_total_mb,
            model_loaded: self.model_loaded,
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone(),
        }
    }
}

/// Copy-out view for `/stats` and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub healthy: bool,
    pub online: bool,
    pub warmup_pending: bool,
    pub ai_ready_present: bool,
    pub ai_ready: bool,
    pub weight: u32,
    pub base_weight: u32,
    pub active_connections: u32,
    pub ewma_response_ms: f64,
    pub failures: u64,
    pub successes: u64,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_util: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_used_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_total_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_loaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Backend {
        Backend::new(BackendAddr::new("10.0.0.1", 9000), 10)
    }

    #[test]
    fn test_addr_parse() {
        assert_eq!(
            BackendAddr::parse("10.0.0.1:9000"),
            Some(BackendAddr::new("10.0.0.1", 9000))
        );
        assert_eq!(BackendAddr::parse("10.0.0.1"), None);
        assert_eq!(BackendAddr::parse(":9000"), None);
        assert_eq!(BackendAddr::parse("10.0.0.1:0"), None);
    }

    #[test]
    fn test_eligibility() {
        let mut b = backend();
        assert!(b.is_eligible());
        b.healthy = false;
        assert!(!b.is_eligible());
        b.healthy = true;
        b.online = false;
        assert!(!b.is_eligible());
        b.online = true;
        b.warmup_pending = true;
        assert!(!b.is_eligible());
        b.warmup_pending = false;
        b.ai_ready_present = true;
        b.ai_ready = false;
        assert!(!b.is_eligible());
        b.ai_ready = true;
        assert!(b.is_eligible());
    }

    #[test]
    fn test_weight_floor_is_one() {
        let mut b = backend();
        b.failures = 1000;
        b.successes = 0;
        b.ewma_response_ms = 10_000.0;
        b.queue_len = Some(10_000);
        b.gpu_util = Some(1.0);
        b.recompute_weight();
        assert_eq!(b.weight, 1);
    }

    #[test]
    fn test_weight_never_exceeds_base() {
        let mut b = backend();
        b.successes = 1000;
        b.recompute_weight();
        assert_eq!(b.weight, b.base_weight);
    }

    #[test]
    fn test_weight_decreases_with_load() {
        let mut idle = backend();
        idle.recompute_weight();
        let mut busy = backend();
        busy.queue_len = Some(50);
        busy.gpu_util = Some(0.9);
        busy.recompute_weight();
        assert!(busy.weight < idle.weight);
    }

    #[test]
    fn test_ewma_smoothing() {
        let mut b = backend();
        b.record_response_ms(100.0);
        assert_eq!(b.ewma_response_ms, 100.0);
        b.record_response_ms(200.0);
        assert!(b.ewma_response_ms > 100.0 && b.ewma_response_ms < 200.0);
        assert_eq!(b.successes, 2);
    }

    #[test]
    fn test_serves_model() {
        let mut b = backend();
        assert!(!b.serves_model("llama"));
        b.model_name = Some("llama".into());
        b.model_loaded = Some(true);
        assert!(b.serves_model("llama"));
        assert!(!b.serves_model_version("llama", "v2"));
        b.model_version = Some("v2".into());
        assert!(b.serves_model_version("llama", "v2"));
    }
}
