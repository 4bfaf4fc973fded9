//! The backend registry and selection front door.
//!
//! All mutation and selection happens under one internal mutex; snapshot
//! reads copy state out before returning. Affinity maps hold backend ids,
//! never references - a dangling entry (backend removed, model unloaded)
//! is cleared lazily on the next selection that trips over it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ai_check::{self, AiCheckConfig, AiStatus};
use crate::backend::{Backend, BackendAddr, BackendSnapshot};
use crate::health::{self, HealthCheckConfig};
use crate::strategy::{create_strategy, Balancer};
use crate::warmup::{self, WarmupConfig};

struct Registry {
    backends: BTreeMap<String, Backend>,
    balancer: Box<dyn Balancer>,
    /// model name -> backend id
    model_affinity: HashMap<String, String>,
    /// "model@version" -> backend id
    model_version_affinity: HashMap<String, String>,
}

/// Thread-safe backend manager.
pub struct BackendManager {
    state: Mutex<Registry>,
    auto_weight: AtomicBool,
    /// New backends start warmup-pending while this is set.
    warmup_gate: AtomicBool,
}

impl BackendManager {
    pub fn new(strategy: &str) -> Self {
        Self {
            state: Mutex::new(Registry {
                backends: BTreeMap::new(),
                balancer: create_strategy(strategy),
                model_affinity: HashMap::new(),
                model_version_affinity: HashMap::new(),
            }),
            auto_weight: AtomicBool::new(false),
            warmup_gate: AtomicBool::new(false),
        }
    }

    pub fn enable_auto_weight(&self, on: bool) {
        self.auto_weight.store(on, Ordering::Relaxed);
    }

    /// Gate newly-added backends behind the warmup prober.
    pub fn enable_warmup_gate(&self, on: bool) {
        self.warmup_gate.store(on, Ordering::Relaxed);
    }

    pub fn set_strategy(&self, name: &str) {
        self.state.lock().balancer = create_strategy(name);
    }

    // ------------------------------------------------------------------
    // Registry mutation
    // ------------------------------------------------------------------

    pub fn add(&self, ip: &str, port: u16, weight: u32) {
        let addr = BackendAddr::new(ip, port);
        let id = addr.id();
        let mut reg = self.state.lock();
        if reg.backends.contains_key(&id) {
            debug!(backend = %id, "add ignored, backend exists");
            return;
        }
        let mut backend = Backend::new(addr, weight);
        backend.warmup_pending = self.warmup_gate.load(Ordering::Relaxed);
        info!(backend = %id, weight, warmup = backend.warmup_pending, "backend added");
        reg.backends.insert(id, backend);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut reg = self.state.lock();
        let removed = reg.backends.remove(id).is_some();
        if removed {
            info!(backend = %id, "backend removed");
        }
        removed
    }

    pub fn set_online(&self, id: &str, online: bool) -> bool {
        self.with_backend(id, |b| {
            b.online = online;
            info!(backend = %b.addr, online, "backend admin state");
        })
    }

    pub fn set_base_weight(&self, id: &str, base_weight: u32) -> bool {
        let auto = self.auto_weight.load(Ordering::Relaxed);
        self.with_backend(id, |b| {
            b.base_weight = base_weight.max(1);
            if auto {
                b.recompute_weight();
            } else {
                b.weight = b.base_weight;
            }
        })
    }

    pub fn set_loaded_model(
        &self,
        id: &str,
        model: &str,
        version: Option<&str>,
        loaded: bool,
    ) -> bool {
        self.with_backend(id, |b| {
            b.model_name = Some(model.to_string());
            b.model_version = version.map(str::to_string);
            b.model_loaded = Some(loaded);
        })
    }

    /// Metrics from an external signal. Negative values leave the metric
    /// untouched; a non-positive VRAM total clears the memory ratio.
    pub fn update_metrics(
        &self,
        id: &str,
        queue_len: i64,
        gpu_util: f64,
        vram_used_mb: i64,
        vram_total_mb: i64,
    ) -> bool {
        let auto = self.auto_weight.load(Ordering::Relaxed);
        self.with_backend(id, |b| {
            if queue_len >= 0 {
                b.queue_len = u32::try_from(queue_len).ok();
            }
            if gpu_util >= 0.0 {
                b.gpu_util = Some(gpu_util.clamp(0.0, 1.0));
            }
            if vram_total_mb > 0 {
                b.vram_used_mb = u32::try_from(vram_used_mb.max(0)).ok();
                b.vram_total_mb = u32::try_from(vram_total_mb).ok();
            }
            if auto {
                b.recompute_weight();
            }
        })
    }

    /// Everything one AI status poll reports, in one lock acquisition.
    pub fn apply_ai_status(&self, id: &str, status: &AiStatus) -> bool {
        let auto = self.auto_weight.load(Ordering::Relaxed);
        self.with_backend(id, |b| {
            if let Some(q) = status.queue_len {
                if q >= 0 {
                    b.queue_len = u32::try_from(q).ok();
                }
            }
            if let Some(gpu) = status.gpu_util {
                if gpu >= 0.0 {
                    b.gpu_util = Some(gpu.clamp(0.0, 1.0));
                }
            }
            if let (Some(used), Some(total)) = (status.vram_used_mb, status.vram_total_mb) {
                if total > 0 {
                    b.vram_used_mb = u32::try_from(used.max(0)).ok();
                    b.vram_total_mb = u32::try_from(total).ok();
                }
            }
            if let Some(ready) = status.ai_ready {
                b.ai_ready_present = true;
                b.ai_ready = ready;
            }
            if let Some(loaded) = status.model_loaded {
                b.model_loaded = Some(loaded);
            }
            if let Some(name) = &status.model_name {
                b.model_name = Some(name.clone());
            }
            if let Some(version) = &status.model_version {
                b.model_version = Some(version.clone());
            }
            if auto {
                b.recompute_weight();
            }
        })
    }

    // ------------------------------------------------------------------
    // Runtime signals from the forwarding path
    // ------------------------------------------------------------------

    pub fn on_conn_start(&self, id: &str) {
        self.with_backend(id, |b| b.active_connections += 1);
    }

    pub fn on_conn_end(&self, id: &str) {
        self.with_backend(id, |b| {
            b.active_connections = b.active_connections.saturating_sub(1);
        });
    }

    pub fn record_response_ms(&self, id: &str, ms: f64) {
        let auto = self.auto_weight.load(Ordering::Relaxed);
        self.with_backend(id, |b| {
            b.record_response_ms(ms);
            if auto {
                b.recompute_weight();
            }
        });
    }

    /// Passive fail-over: the backend drops out of rotation immediately;
    /// the active checker may bring it back later.
    pub fn report_failure(&self, id: &str) {
        let auto = self.auto_weight.load(Ordering::Relaxed);
        let flipped = self.with_backend(id, |b| {
            b.failures += 1;
            if b.healthy {
                b.healthy = false;
            }
            if auto {
                b.recompute_weight();
            }
        });
        if flipped {
            warn!(backend = %id, "backend marked unhealthy (passive)");
        }
    }

    /// Returns true when the flag actually changed.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> bool {
        let mut changed = false;
        self.with_backend(id, |b| {
            changed = b.healthy != healthy;
            b.healthy = healthy;
        });
        changed
    }

    pub fn complete_warmup(&self, id: &str) -> bool {
        self.with_backend(id, |b| b.warmup_pending = false)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Pick an eligible backend for `key`, or None when nothing is
    /// eligible.
    pub fn select(&self, key: &str) -> Option<BackendAddr> {
        self.select_inner(key, None, None)
    }

    /// Prefer backends serving `model`; fall back to the strategy over
    /// all eligible backends. A pick that serves the model is recorded in
    /// the affinity map for stickiness.
    pub fn select_for_model(&self, key: &str, model: &str) -> Option<BackendAddr> {
        self.select_inner(key, Some(model), None)
    }

    pub fn select_for_model_version(
        &self,
        key: &str,
        model: &str,
        version: &str,
    ) -> Option<BackendAddr> {
        self.select_inner(key, Some(model), Some(version))
    }

    fn select_inner(
        &self,
        key: &str,
        model: Option<&str>,
        version: Option<&str>,
    ) -> Option<BackendAddr> {
        let mut guard = self.state.lock();
        let reg = &mut *guard;

        // Sticky affinity fast path, with lazy cleanup of dangling entries.
        if let Some(model) = model {
            let (map, affinity_key) = match version {
                Some(v) => (&mut reg.model_version_affinity, format!("{model}@{v}")),
                None => (&mut reg.model_affinity, model.to_string()),
            };
            if let Some(id) = map.get(&affinity_key).cloned() {
                let still_good = reg.backends.get(&id).map(|b| {
                    b.is_eligible()
                        && match version {
                            Some(v) => b.serves_model_version(model, v),
                            None => b.serves_model(model),
                        }
                });
                match still_good {
                    Some(true) => {
                        return reg.backends.get(&id).map(|b| b.addr.clone());
                    }
                    _ => {
                        map.remove(&affinity_key);
                    }
                }
            }
        }

        let eligible: Vec<&Backend> =
            reg.backends.values().filter(|b| b.is_eligible()).collect();
        if eligible.is_empty() {
            return None;
        }

        // Model-serving subset first, the whole eligible set as fallback.
        let picked_id = if let Some(model) = model {
            let serving: Vec<&Backend> = eligible
                .iter()
                .copied()
                .filter(|b| match version {
                    Some(v) => b.serves_model_version(model, v),
                    None => b.serves_model(model),
                })
                .collect();
            if serving.is_empty() {
                reg.balancer.select(&eligible, key)?
            } else {
                reg.balancer.select(&serving, key)?
            }
        } else {
            reg.balancer.select(&eligible, key)?
        };

        let picked = reg.backends.get(&picked_id)?;
        let addr = picked.addr.clone();
        if let Some(model) = model {
            let serves = match version {
                Some(v) => picked.serves_model_version(model, v),
                None => picked.serves_model(model),
            };
            if serves {
                match version {
                    Some(v) => {
                        reg.model_version_affinity
                            .insert(format!("{model}@{v}"), picked_id);
                    }
                    None => {
                        reg.model_affinity.insert(model.to_string(), picked_id);
                    }
                }
            }
        }
        Some(addr)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.state.lock().backends.values().map(Backend::snapshot).collect()
    }

    pub fn backend_addrs(&self) -> Vec<BackendAddr> {
        self.state
            .lock()
            .backends
            .values()
            .map(|b| b.addr.clone())
            .collect()
    }

    pub fn warmup_pending_addrs(&self) -> Vec<BackendAddr> {
        self.state
            .lock()
            .backends
            .values()
            .filter(|b| b.warmup_pending && b.online)
            .map(|b| b.addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Checker wiring
    // ------------------------------------------------------------------

    pub fn start_health_check(self: &Arc<Self>, cfg: HealthCheckConfig) -> JoinHandle<()> {
        health::spawn(Arc::clone(self), cfg)
    }

    pub fn start_ai_check(self: &Arc<Self>, cfg: AiCheckConfig) -> JoinHandle<()> {
        ai_check::spawn(Arc::clone(self), cfg)
    }

    pub fn start_warmup(self: &Arc<Self>, cfg: WarmupConfig) -> JoinHandle<()> {
        self.enable_warmup_gate(true);
        warmup::spawn(Arc::clone(self), cfg)
    }

    fn with_backend(&self, id: &str, f: impl FnOnce(&mut Backend)) -> bool {
        let mut reg = self.state.lock();
        match reg.backends.get_mut(id) {
            Some(b) => {
                f(b);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(n: usize) -> BackendManager {
        let m = BackendManager::new("roundrobin");
        for i in 1..=n {
            m.add(&format!("10.0.0.{i}"), 9000, 1);
        }
        m
    }

    #[test]
    fn test_select_none_when_empty() {
        let m = BackendManager::new("roundrobin");
        assert_eq!(m.select("k"), None);
    }

    #[test]
    fn test_select_never_returns_ineligible() {
        let m = manager_with(3);
        m.set_online("10.0.0.1:9000", false);
        m.set_healthy("10.0.0.2:9000", false);
        for _ in 0..50 {
            let addr = m.select("k").unwrap();
            assert_eq!(addr.id(), "10.0.0.3:9000");
        }
    }

    #[test]
    fn test_passive_failover() {
        // S5: after report_failure(b1), selection always lands on b2.
        let m = manager_with(2);
        m.report_failure("10.0.0.1:9000");
        for _ in 0..10 {
            assert_eq!(m.select("k").unwrap().id(), "10.0.0.2:9000");
        }
        let snap = m.snapshot();
        let b1 = snap.iter().find(|b| b.id == "10.0.0.1:9000").unwrap();
        assert!(!b1.healthy);
        assert_eq!(b1.failures, 1);
    }

    #[test]
    fn test_health_recovery_restores_rotation() {
        let m = manager_with(2);
        m.report_failure("10.0.0.1:9000");
        assert!(m.set_healthy("10.0.0.1:9000", true));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            seen.insert(m.select("k").unwrap().id());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_warmup_gating() {
        // S6: a gated backend is invisible until warmup completes.
        let m = BackendManager::new("roundrobin");
        m.enable_warmup_gate(true);
        m.add("10.0.0.1", 9000, 1);
        assert_eq!(m.select("k"), None);
        assert_eq!(m.warmup_pending_addrs().len(), 1);

        m.complete_warmup("10.0.0.1:9000");
        assert_eq!(m.select("k").unwrap().id(), "10.0.0.1:9000");
        assert!(m.warmup_pending_addrs().is_empty());
    }

    #[test]
    fn test_model_affinity_sticky() {
        let m = manager_with(3);
        m.set_loaded_model("10.0.0.2:9000", "llama", None, true);
        for _ in 0..10 {
            assert_eq!(
                m.select_for_model("k", "llama").unwrap().id(),
                "10.0.0.2:9000"
            );
        }
    }

    #[test]
    fn test_model_fallback_when_nobody_serves() {
        let m = manager_with(2);
        assert!(m.select_for_model("k", "ghost-model").is_some());
    }

    #[test]
    fn test_affinity_cleared_when_backend_removed() {
        let m = manager_with(2);
        m.set_loaded_model("10.0.0.1:9000", "llama", None, true);
        assert_eq!(
            m.select_for_model("k", "llama").unwrap().id(),
            "10.0.0.1:9000"
        );
        m.remove("10.0.0.1:9000");
        // Dangling affinity entry is cleared lazily; selection falls back.
        assert_eq!(
            m.select_for_model("k", "llama").unwrap().id(),
            "10.0.0.2:9000"
        );
    }

    #[test]
    fn test_affinity_skips_ineligible_sticky_backend() {
        let m = manager_with(2);
        m.set_loaded_model("10.0.0.1:9000", "llama", None, true);
        m.select_for_model("k", "llama");
        m.report_failure("10.0.0.1:9000");
        assert_eq!(
            m.select_for_model("k", "llama").unwrap().id(),
            "10.0.0.2:9000"
        );
    }

    #[test]
    fn test_model_version_affinity() {
        let m = manager_with(3);
        m.set_loaded_model("10.0.0.3:9000", "llama", Some("v2"), true);
        assert_eq!(
            m.select_for_model_version("k", "llama", "v2").unwrap().id(),
            "10.0.0.3:9000"
        );
        // Version mismatch falls back to the full eligible set.
        assert!(m.select_for_model_version("k", "llama", "v9").is_some());
    }

    #[test]
    fn test_conn_tracking_and_ewma() {
        let m = manager_with(1);
        m.on_conn_start("10.0.0.1:9000");
        m.on_conn_start("10.0.0.1:9000");
        m.on_conn_end("10.0.0.1:9000");
        m.record_response_ms("10.0.0.1:9000", 42.0);
        let snap = &m.snapshot()[0];
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.ewma_response_ms, 42.0);
        assert_eq!(snap.successes, 1);
    }

    #[test]
    fn test_auto_weight_reacts_to_metrics() {
        let m = BackendManager::new("weighted");
        m.enable_auto_weight(true);
        m.add("10.0.0.1", 9000, 10);
        m.update_metrics("10.0.0.1:9000", 100, 0.95, 7000, 8000);
        let snap = &m.snapshot()[0];
        assert!(snap.weight < snap.base_weight);
        assert!(snap.weight >= 1);
    }

    #[test]
    fn test_update_metrics_ignores_negative() {
        let m = manager_with(1);
        m.update_metrics("10.0.0.1:9000", 5, 0.5, 100, 1000);
        m.update_metrics("10.0.0.1:9000", -1, -1.0, -1, -1);
        let snap = &m.snapshot()[0];
        assert_eq!(snap.queue_len, Some(5));
        assert_eq!(snap.gpu_util, Some(0.5));
        assert_eq!(snap.vram_total_mb, Some(1000));
    }

    #[test]
    fn test_ai_ready_gates_selection() {
        let m = manager_with(1);
        let status = AiStatus {
            ai_ready: Some(false),
            ..Default::default()
        };
        m.apply_ai_status("10.0.0.1:9000", &status);
        assert_eq!(m.select("k"), None);
        let status = AiStatus {
            ai_ready: Some(true),
            ..Default::default()
        };
        m.apply_ai_status("10.0.0.1:9000", &status);
        assert!(m.select("k").is_some());
    }

    #[test]
    fn test_duplicate_add_keeps_state() {
        let m = manager_with(1);
        m.report_failure("10.0.0.1:9000");
        m.add("10.0.0.1", 9000, 5);
        let snap = &m.snapshot()[0];
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.base_weight, 1);
    }
}
