//! AI service checker.
//!
//! Periodically fetches `<ai_path>` from every backend and feeds the JSON
//! metrics back into the registry: queue depth, GPU/VRAM usage, readiness
//! and the loaded model. A backend that reports `ai_ready: false` drops
//! out of rotation until a later poll says otherwise; a backend that
//! never answers keeps its last known metrics.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::BackendManager;
use crate::probe;

#[derive(Debug, Clone)]
pub struct AiCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub http_host: String,
    pub http_path: String,
}

impl Default for AiCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            http_host: "127.0.0.1".to_string(),
            http_path: "/ai/status".to_string(),
        }
    }
}

/// The status document an AI backend serves. Every field is optional;
/// absent metrics are simply not updated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiStatus {
    pub queue_len: Option<i64>,
    pub gpu_util: Option<f64>,
    pub vram_used_mb: Option<i64>,
    pub vram_total_mb: Option<i64>,
    pub ai_ready: Option<bool>,
    pub model_loaded: Option<bool>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
}

pub fn spawn(manager: Arc<BackendManager>, cfg: AiCheckConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let addrs = manager.backend_addrs();
            let mut polls = Vec::with_capacity(addrs.len());
            for addr in addrs {
                let cfg = cfg.clone();
                let manager = Arc::clone(&manager);
                polls.push(tokio::spawn(async move {
                    match probe::http_get(&addr, &cfg.http_host, &cfg.http_path, cfg.timeout).await
                    {
                        Ok((status, body)) if (200..300).contains(&status) => {
                            match serde_json::from_slice::<AiStatus>(&body) {
                                Ok(ai) => {
                                    manager.apply_ai_status(&addr.id(), &ai);
                                }
                                Err(err) => {
                                    debug!(backend = %addr, %err, "bad ai status body");
                                }
                            }
                        }
                        Ok((status, _)) => {
                            debug!(backend = %addr, status, "ai status non-2xx");
                        }
                        Err(err) => {
                            debug!(backend = %addr, %err, "ai status probe failed");
                        }
                    }
                }));
            }
            for p in polls {
                let _ = p.await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_deserialize_full() {
        let body = r#"{"queue_len":3,"gpu_util":0.42,"vram_used_mb":2048,
            "vram_total_mb":8192,"ai_ready":true,"model_loaded":true,
            "model_name":"llama","model_version":"v2"}"#;
        let s: AiStatus = serde_json::from_str(body).unwrap();
        assert_eq!(s.queue_len, Some(3));
        assert_eq!(s.gpu_util, Some(0.42));
        assert_eq!(s.ai_ready, Some(true));
        assert_eq!(s.model_name.as_deref(), Some("llama"));
    }

    #[test]
    fn test_status_deserialize_partial() {
        let s: AiStatus = serde_json::from_str(r#"{"queue_len":1}"#).unwrap();
        assert_eq!(s.queue_len, Some(1));
        assert!(s.ai_ready.is_none());
        assert!(s.model_name.is_none());
    }

    #[test]
    fn test_status_rejects_garbage() {
        assert!(serde_json::from_str::<AiStatus>("not json").is_err());
    }
}
