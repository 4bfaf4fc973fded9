//! Warmup gating.
//!
//! A backend that enters rotation with warmup enabled stays ineligible
//! until `POST <warmup_path>?model=<model>` answers 2xx. The prober
//! retries every cycle for any backend still pending, so a backend that
//! was added while its model server was cold joins once the preload
//! finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::manager::BackendManager;
use crate::probe;

#[derive(Debug, Clone)]
pub struct WarmupConfig {
    pub model: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub http_host: String,
    pub http_path: String,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
            http_host: "127.0.0.1".to_string(),
            http_path: "/ai/warmup".to_string(),
        }
    }
}

impl WarmupConfig {
    fn request_path(&self) -> String {
        if self.model.is_empty() {
            self.http_path.clone()
        } else {
            format!("{}?model={}", self.http_path, self.model)
        }
    }
}

pub fn spawn(manager: Arc<BackendManager>, cfg: WarmupConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let pending = manager.warmup_pending_addrs();
            for addr in pending {
                let path = cfg.request_path();
                match probe::http_post(&addr, &cfg.http_host, &path, cfg.timeout).await {
                    Ok(status) if (200..300).contains(&status) => {
                        manager.complete_warmup(&addr.id());
                        info!(backend = %addr, model = %cfg.model, "warmup complete");
                    }
                    Ok(status) => {
                        debug!(backend = %addr, status, "warmup not ready");
                    }
                    Err(err) => {
                        debug!(backend = %addr, %err, "warmup probe failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_path() {
        let cfg = WarmupConfig {
            model: "llama".into(),
            ..Default::default()
        };
        assert_eq!(cfg.request_path(), "/ai/warmup?model=llama");
        let bare = WarmupConfig::default();
        assert_eq!(bare.request_path(), "/ai/warmup");
    }
}
