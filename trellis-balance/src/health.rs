//! Active health checking.
//!
//! Timer-driven probes flip each backend's `healthy` flag. Passive
//! failures reported by the forwarding path flip it to false immediately;
//! the next probe cycle may bring the backend back.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::manager::BackendManager;
use crate::probe;

/// Probe flavor, from `[health_check] mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthMode {
    Off,
    #[default]
    Tcp,
    Http,
    Script,
}

impl HealthMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(HealthMode::Off),
            "tcp" => Some(HealthMode::Tcp),
            "http" => Some(HealthMode::Http),
            "script" => Some(HealthMode::Script),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub mode: HealthMode,
    pub interval: Duration,
    pub timeout: Duration,
    pub http_host: String,
    pub http_path: String,
    pub script_cmd: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            mode: HealthMode::Tcp,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            http_host: "127.0.0.1".to_string(),
            http_path: "/health".to_string(),
            script_cmd: String::new(),
        }
    }
}

/// Spawn the checker loop. All backends are probed concurrently each
/// cycle; results apply as they land.
pub fn spawn(manager: Arc<BackendManager>, cfg: HealthCheckConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if cfg.mode == HealthMode::Off {
            return;
        }
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let addrs = manager.backend_addrs();
            let mut probes = Vec::with_capacity(addrs.len());
            for addr in addrs {
                let cfg = cfg.clone();
                let manager = Arc::clone(&manager);
                probes.push(tokio::spawn(async move {
                    let healthy = match cfg.mode {
                        HealthMode::Off => return,
                        HealthMode::Tcp => probe::tcp_probe(&addr, cfg.timeout).await,
                        HealthMode::Http => {
                            probe::http_probe(&addr, &cfg.http_host, &cfg.http_path, cfg.timeout)
                                .await
                        }
                        HealthMode::Script => {
                            probe::script_probe(&cfg.script_cmd, &addr.id(), cfg.timeout).await
                        }
                    };
                    if manager.set_healthy(&addr.id(), healthy) {
                        if healthy {
                            info!(backend = %addr, "backend back in rotation");
                        } else {
                            info!(backend = %addr, "backend failed health check");
                        }
                    } else {
                        debug!(backend = %addr, healthy, "health check unchanged");
                    }
                }));
            }
            for p in probes {
                let _ = p.await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(HealthMode::parse("tcp"), Some(HealthMode::Tcp));
        assert_eq!(HealthMode::parse("http"), Some(HealthMode::Http));
        assert_eq!(HealthMode::parse("script"), Some(HealthMode::Script));
        assert_eq!(HealthMode::parse("off"), Some(HealthMode::Off));
        assert_eq!(HealthMode::parse("icmp"), None);
    }
}
