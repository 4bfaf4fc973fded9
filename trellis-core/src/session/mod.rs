//! The L7 session engine.
//!
//! One task serves one client connection; the submodules split the work:
//!
//! - [`http1`]: the HTTP/1.1 connection loop (pipelining, keep-alive)
//! - [`h2`]: the HTTP/2 connection loop and gRPC built-ins
//! - [`forward`]: the upstream exchange (pass-through / transform modes)
//! - [`admin`]: locally-answered admin endpoints
//! - [`batch`]: batch split and loop-local request coalescing
//! - [`tunnel`]: the L4 splice WebSocket upgrades hand off to

pub mod admin;
pub mod batch;
pub mod forward;
pub mod h2;
pub mod http1;
pub mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use trellis_balance::BackendManager;
use trellis_cache::ResponseCache;
use trellis_config::Settings;
use trellis_ratelimit::{CongestionControl, ConnLimiter, KeyedLimiter, TokenBucket};

use crate::access::AccessControl;
use crate::audit::AuditLog;
use crate::error::ProxyError;
use crate::history::HistoryStore;
use crate::net::{listener::AcceptGate, ClientStream, ConnPermit, Protocol};
use crate::plugin::RequestPlugin;
use crate::rewrite::RewriteEngine;
use crate::sched::{DispatcherSet, SchedConfig};
use crate::stats::Metrics;
use crate::upstream::ConnectionPool;

use self::batch::BatcherSet;

/// How the affinity key of a request is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityMode {
    #[default]
    Ip,
    Header,
    Cookie,
}

impl AffinityMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(AffinityMode::Ip),
            "header" => Some(AffinityMode::Header),
            "cookie" => Some(AffinityMode::Cookie),
            _ => None,
        }
    }
}

/// Tunables of the request path.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub affinity_mode: AffinityMode,
    pub affinity_header: String,
    pub affinity_cookie: String,
    pub model_header: String,
    pub model_version_header: String,
    /// Header naming the user for per-user connection slots; the client
    /// IP is the fallback key.
    pub user_header: String,
    /// Transform-mode buffer cap; overflow falls back to pass-through.
    pub transform_max_bytes: usize,
    pub upstream_wait: Duration,
    pub client_idle: Duration,
    pub cache_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            affinity_mode: AffinityMode::Ip,
            affinity_header: "X-Affinity".to_string(),
            affinity_cookie: "affinity".to_string(),
            model_header: "X-Model".to_string(),
            model_version_header: "X-Model-Version".to_string(),
            user_header: "X-User".to_string(),
            transform_max_bytes: 4 * 1024 * 1024,
            upstream_wait: Duration::from_secs(30),
            client_idle: Duration::from_secs(60),
            cache_enabled: false,
        }
    }
}

/// Everything a session needs, shared across all connections.
pub struct ProxyContext {
    pub cfg: EngineConfig,
    pub metrics: Arc<Metrics>,
    pub manager: Arc<BackendManager>,
    pub pool: Arc<ConnectionPool>,
    pub access: AccessControl,
    pub plugins: Vec<Arc<dyn RequestPlugin>>,
    pub rewrite: RewriteEngine,
    pub cache: Option<ResponseCache>,
    pub request_bucket: TokenBucket,
    pub per_ip_bucket: KeyedLimiter,
    pub per_path_bucket: KeyedLimiter,
    pub user_conns: ConnLimiter,
    pub service_conns: ConnLimiter,
    pub congestion: CongestionControl,
    pub dispatchers: DispatcherSet,
    pub sched_cfg: SchedConfig,
    pub batchers: Option<BatcherSet>,
    pub audit: AuditLog,
    pub history: Option<Arc<HistoryStore>>,
    pub accept_gate: Arc<AcceptGate>,
    pub acme_dir: Option<PathBuf>,
    pub settings: Mutex<Settings>,
    pub config_path: Option<PathBuf>,
}

/// Per-connection admission slots, released when the connection ends.
#[derive(Default)]
pub struct ConnSlots {
    user_key: Option<String>,
    service_key: Option<String>,
}

impl ConnSlots {
    /// Acquire both slots on the first request of a connection.
    /// Returns false when either cap refuses.
    pub fn acquire_once(
        &mut self,
        ctx: &ProxyContext,
        user_key: &str,
        service_key: &str,
    ) -> bool {
        if self.user_key.is_some() || self.service_key.is_some() {
            return true;
        }
        if !ctx.user_conns.try_acquire(user_key) {
            return false;
        }
        if !ctx.service_conns.try_acquire(service_key) {
            ctx.user_conns.release(user_key);
            return false;
        }
        self.user_key = Some(user_key.to_string());
        self.service_key = Some(service_key.to_string());
        true
    }

    pub fn release(&mut self, ctx: &ProxyContext) {
        if let Some(key) = self.user_key.take() {
            ctx.user_conns.release(&key);
        }
        if let Some(key) = self.service_key.take() {
            ctx.service_conns.release(&key);
        }
    }
}

/// First path segment, the per-service connection key.
pub fn service_key(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    }
}

/// Entry point for one accepted L7 connection: sniffs the application
/// protocol and hands off to the matching loop.
pub async fn serve_connection(
    ctx: Arc<ProxyContext>,
    mut stream: ClientStream,
    shard: usize,
    _permit: ConnPermit,
) {
    let peer_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string());
    ctx.metrics.conn_opened();

    let result = async {
        // Sniff on the first bytes (post-TLS, so h2c-over-TLS sniffs too).
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let protocol = loop {
            if let Some(p) = crate::net::sniff::detect(&buf) {
                break p;
            }
            let n = tokio::time::timeout(ctx.cfg.client_idle, stream.read_buf(&mut buf))
                .await
                .map_err(|_| {
                    ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "client idle before first request",
                    ))
                })??;
            if n == 0 {
                return Ok(()); // closed before sending anything
            }
            ctx.metrics.add_bytes_in(n as u64);
        };

        match protocol {
            Protocol::Http1 => http1::serve(&ctx, stream, &peer_ip, shard, buf).await,
            Protocol::Http2 => h2::serve(&ctx, stream, &peer_ip, shard, buf).await,
        }
    }
    .await;

    match result {
        Ok(()) => debug!(peer = %peer_ip, "connection finished"),
        Err(err) => warn!(peer = %peer_ip, %err, "connection aborted"),
    }
    ctx.metrics.conn_closed();
}
