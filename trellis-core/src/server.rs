//! Server assembly: configuration in, running listeners out.
//!
//! `ProxyServer::from_settings` builds every component from the INI
//! model; `start` binds the sockets, spawns the control-plane timers
//! (health / AI / warmup checkers, history sampler, UDP sweep) and the
//! accept loops, and returns a handle tests and `main` can wait on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use trellis_balance::ai_check::AiCheckConfig;
use trellis_balance::health::{HealthCheckConfig, HealthMode};
use trellis_balance::warmup::WarmupConfig;
use trellis_balance::BackendManager;
use trellis_cache::{CacheConfig, ResponseCache};
use trellis_config::{validation, Settings};
use trellis_ratelimit::{
    CongestionConfig, CongestionControl, ConnLimiter, ConnLimiterConfig, KeyedLimiter,
    KeyedLimiterConfig, TokenBucket,
};

use crate::access::{AccessConfig, AccessControl, IpMode};
use crate::audit::AuditLog;
use crate::error::ProxyError;
use crate::history::{HistoryConfig, HistoryStore};
use crate::net::{self, listener, AcceptDecision, AcceptGate, AcceptGateConfig};
use crate::rewrite::{RewriteEngine, RewriteRule};
use crate::sched::{DispatcherSet, SchedConfig, SchedMode};
use crate::session::batch::{BatchConfig, BatcherSet};
use crate::session::{self, AffinityMode, EngineConfig, ProxyContext};
use crate::stats::Metrics;
use crate::udp::{self, UdpProxyConfig};
use crate::upstream::{ConnectionPool, PoolConfig};

/// A configured-but-not-started proxy.
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    listen_port: u16,
    reuse_port: bool,
    shards: usize,
    tls: Option<TlsAcceptor>,
    l4_port: Option<u16>,
    udp_cfg: Option<UdpProxyConfig>,
    health_cfg: Option<HealthCheckConfig>,
    ai_cfg: Option<AiCheckConfig>,
    warmup_cfg: Option<WarmupConfig>,
}

/// Handle to a started proxy.
pub struct RunningProxy {
    pub l7_addr: SocketAddr,
    pub ctx: Arc<ProxyContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningProxy {
    /// Block until any listener task exits (they normally never do).
    pub async fn wait(mut self) {
        if let Some(first) = self.tasks.drain(..).next() {
            let _ = first.await;
        }
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl ProxyServer {
    pub fn from_settings(
        settings: Settings,
        config_path: Option<PathBuf>,
    ) -> Result<Self, ProxyError> {
        validation::validate(&settings)
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let s = &settings;
        let listen_port = s.get_i64("global", "listen_port", 8080) as u16;
        let reuse_port = s.get_bool("global", "reuse_port", false);
        let shards = s.get_i64("global", "threads", 4).clamp(1, 512) as usize;
        let strategy = s.get_str("global", "strategy", "roundrobin");

        // Backends and their manager.
        let manager = Arc::new(BackendManager::new(&strategy));
        manager.enable_auto_weight(s.get_bool("service_discovery", "auto_weight", false));
        let warmup_enabled = s.get_bool("warmup", "enable", false);
        if warmup_enabled {
            manager.enable_warmup_gate(true);
        }
        for (name, value) in s.section("backends") {
            match validation::parse_backend_value(&value) {
                Some((ip, port, weight)) => manager.add(&ip, port, weight),
                None => warn!(backend = %name, %value, "skipping malformed backend entry"),
            }
        }

        let metrics = Arc::new(Metrics::new());
        let pool = ConnectionPool::new(PoolConfig {
            idle_ttl: secs(s.get_f64("pool", "idle_ttl_sec", 30.0)),
            max_idle_per_backend: s.get_i64("pool", "max_idle_per_backend", 32) as usize,
            max_idle_total: s.get_i64("pool", "max_idle_total", 256) as usize,
            connect_timeout: secs(s.get_f64("pool", "connect_timeout_sec", 3.0)),
        });

        let access = AccessControl::new(AccessConfig {
            ip_mode: IpMode::parse(&s.get_str("access_control", "ip_mode", "off"))
                .unwrap_or(IpMode::Off),
            cidrs: s.get_list("access_control", "cidrs"),
            require_token: s.get_bool("access_control", "require_token", false),
            token_header: s.get_str("access_control", "token_header", "X-Api-Token"),
            valid_tokens: s.get_list("access_control", "valid_tokens"),
            require_api_key: s.get_bool("access_control", "require_api_key", false),
            api_key_header: s.get_str("access_control", "api_key_header", "X-Api-Key"),
            valid_api_keys: s.get_list("access_control", "valid_api_keys"),
        });

        let rewrite = RewriteEngine::new(parse_rewrite_rules(s));

        let cache_enabled = s.get_bool("cache", "enable", false);
        let cache = cache_enabled.then(|| {
            ResponseCache::from_config(&CacheConfig {
                enabled: true,
                backend: s.get_str("cache", "backend", "memory"),
                host: s.get_str("cache", "host", "127.0.0.1"),
                port: s.get_i64("cache", "port", 11211) as u16,
                ttl_sec: s.get_i64("cache", "ttl_sec", 60) as u64,
                max_value_bytes: s.get_i64("cache", "max_value_bytes", 256 * 1024) as usize,
                timeout_ms: s.get_i64("cache", "timeout_ms", 200) as u64,
            })
        });

        let request_bucket = TokenBucket::new(
            s.get_f64("rate_limit", "qps", 0.0),
            s.get_f64("rate_limit", "burst", 0.0),
        );
        let per_ip_bucket = KeyedLimiter::new(KeyedLimiterConfig {
            qps: s.get_f64("rate_limit", "per_ip_qps", 0.0),
            burst: s.get_f64("rate_limit", "per_ip_burst", 0.0),
            idle: secs(s.get_f64("rate_limit", "per_ip_idle_sec", 60.0)),
            max_entries: s.get_i64("rate_limit", "per_ip_max_entries", 10_000) as usize,
            cleanup_every: 256,
        });
        let per_path_bucket = KeyedLimiter::new(KeyedLimiterConfig {
            qps: s.get_f64("rate_limit", "per_path_qps", 0.0),
            burst: s.get_f64("rate_limit", "per_path_burst", 0.0),
            idle: secs(s.get_f64("rate_limit", "per_path_idle_sec", 60.0)),
            max_entries: s.get_i64("rate_limit", "per_path_max_entries", 10_000) as usize,
            cleanup_every: 256,
        });
        let user_conns = ConnLimiter::new(ConnLimiterConfig {
            max_per_key: s.get_i64("connection_limit", "max_per_user", 0) as usize,
            max_entries: s.get_i64("connection_limit", "user_max_entries", 10_000) as usize,
        });
        let service_conns = ConnLimiter::new(ConnLimiterConfig {
            max_per_key: s.get_i64("connection_limit", "max_per_service", 0) as usize,
            max_entries: s.get_i64("connection_limit", "service_max_entries", 10_000) as usize,
        });
        let congestion = CongestionControl::new(CongestionConfig {
            enabled: s.get_bool("congestion", "enable", false),
            initial_window: s.get_i64("congestion", "initial_window", 64) as usize,
            min_window: s.get_i64("congestion", "min_window", 1) as usize,
            max_window: s.get_i64("congestion", "max_window", 1024) as usize,
            additive_increase: s.get_i64("congestion", "additive_increase", 1) as usize,
            beta: s.get_f64("congestion", "multiplicative_decrease", 0.7),
        });

        let sched_cfg = SchedConfig {
            mode: SchedMode::parse(&s.get_str("priority", "mode", "off")).unwrap_or(SchedMode::Off),
            max_inflight: s.get_i64("priority", "max_inflight", 64) as usize,
            low_delay: Duration::from_millis(s.get_i64("priority", "low_delay_ms", 0) as u64),
            priority_header: s.get_str("priority", "header_name", "X-Priority"),
            priority_query: s.get_str("priority", "query_name", "priority"),
            flow_header: s.get_str("priority", "flow_header_name", "X-Flow"),
            flow_query: s.get_str("priority", "flow_query_name", "flow"),
            deadline_header: s.get_str("priority", "deadline_header_name", "X-Deadline-Ms"),
            deadline_query: s.get_str("priority", "deadline_query_name", "deadline_ms"),
            default_deadline: Duration::from_millis(
                s.get_i64("priority", "default_deadline_ms", 1000) as u64,
            ),
        };
        let dispatchers = DispatcherSet::new(&sched_cfg, shards);

        let batchers = s.get_bool("batch", "enable", false).then(|| {
            BatcherSet::new(
                BatchConfig {
                    window: Duration::from_millis(s.get_i64("batch", "window_ms", 5).max(0) as u64),
                    max_batch_size: s.get_i64("batch", "max_batch_size", 16).max(1) as usize,
                    max_batch_bytes: s.get_i64("batch", "max_batch_bytes", 256 * 1024).max(1)
                        as usize,
                    max_response_bytes: s
                        .get_i64("batch", "max_response_bytes", 1024 * 1024)
                        .max(1) as usize,
                    require_header: s.get_bool("batch", "require_header", true),
                    header_name: s.get_str("batch", "header_name", "X-Batch"),
                    paths: s.get_list("batch", "paths"),
                },
                shards,
            )
        });

        let audit = match s.get("audit_log", "path") {
            Some(path) if !path.is_empty() => AuditLog::with_file(path),
            _ => AuditLog::new(),
        };

        let history = s.get_bool("history", "enable", false).then(|| {
            HistoryStore::new(
                HistoryConfig {
                    sample_ms: s.get_i64("history", "sample_ms", 1000) as u64,
                    max_points: s.get_i64("history", "max_points", 3600) as usize,
                    persist_path: s
                        .get("history", "persist_path")
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from),
                },
                Arc::clone(&metrics),
            )
        });

        let accept_gate = AcceptGate::new(AcceptGateConfig {
            accept_qps: s.get_f64("ddos", "accept_qps", 0.0),
            accept_burst: s.get_f64("ddos", "accept_burst", 0.0),
            per_ip_qps: s.get_f64("ddos", "per_ip_accept_qps", 0.0),
            per_ip_burst: s.get_f64("ddos", "per_ip_accept_burst", 0.0),
            per_ip_idle: secs(s.get_f64("ddos", "per_ip_idle_sec", 60.0)),
            per_ip_max_entries: s.get_i64("ddos", "per_ip_max_entries", 10_000) as usize,
            max_total: s.get_i64("connection_limit", "max_total", 0) as usize,
            max_per_ip: s.get_i64("connection_limit", "max_per_ip", 0) as usize,
        });

        let cfg = EngineConfig {
            affinity_mode: AffinityMode::parse(&s.get_str("session_affinity", "mode", "ip"))
                .unwrap_or(AffinityMode::Ip),
            affinity_header: s.get_str("session_affinity", "header_name", "X-Affinity"),
            affinity_cookie: s.get_str("session_affinity", "cookie_name", "affinity"),
            model_header: "X-Model".to_string(),
            model_version_header: "X-Model-Version".to_string(),
            user_header: s.get_str("connection_limit", "user_header", "X-User"),
            transform_max_bytes: s.get_i64("global", "transform_max_bytes", 4 * 1024 * 1024)
                as usize,
            upstream_wait: secs(s.get_f64("global", "upstream_timeout_sec", 30.0)),
            client_idle: secs(s.get_f64("connection_limit", "idle_timeout_sec", 60.0)),
            cache_enabled,
        };

        // TLS + ACME.
        let tls = if s.get_bool("tls", "enable", false) {
            let cert = s.get_str("tls", "cert_path", "");
            let key = s.get_str("tls", "key_path", "");
            Some(net::tls::build_acceptor(
                std::path::Path::new(&cert),
                std::path::Path::new(&key),
            )?)
        } else {
            None
        };
        let acme_dir = s
            .get("tls", "acme_challenge_dir")
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        // Control-plane checkers.
        let health_mode = HealthMode::parse(&s.get_str("health_check", "mode", "tcp"))
            .unwrap_or(HealthMode::Tcp);
        let health_cfg = (health_mode != HealthMode::Off).then(|| HealthCheckConfig {
            mode: health_mode,
            interval: secs(s.get_f64("health_check", "interval", 5.0)),
            timeout: secs(s.get_f64("health_check", "timeout", 2.0)),
            http_host: s.get_str("health_check", "http_host", "127.0.0.1"),
            http_path: s.get_str("health_check", "http_path", "/health"),
            script_cmd: s.get_str("health_check", "script_cmd", ""),
        });
        let ai_cfg = s.get_bool("ai_check", "enable", false).then(|| AiCheckConfig {
            interval: secs(s.get_f64("ai_check", "interval", 5.0)),
            timeout: secs(s.get_f64("ai_check", "timeout", 2.0)),
            http_host: s.get_str("ai_check", "http_host", "127.0.0.1"),
            http_path: s.get_str("ai_check", "http_path", "/ai/status"),
        });
        let warmup_cfg = warmup_enabled.then(|| WarmupConfig {
            model: s.get_str("warmup", "model", ""),
            interval: secs(s.get_f64("warmup", "interval", 2.0)),
            timeout: secs(s.get_f64("warmup", "timeout", 2.0)),
            http_host: s.get_str("warmup", "http_host", "127.0.0.1"),
            http_path: s.get_str("warmup", "http_path", "/ai/warmup"),
        });

        let l4_port = s.get("l4", "listen_port").and_then(|p| p.parse().ok());
        let udp_cfg = s.get("udp", "listen_port").and_then(|p| p.parse().ok()).map(
            |listen_port| UdpProxyConfig {
                listen_port,
                idle_timeout: secs(s.get_f64("udp", "idle_timeout_sec", 10.0)),
                cleanup_interval: secs(s.get_f64("udp", "cleanup_interval_sec", 1.0)),
            },
        );

        let ctx = Arc::new(ProxyContext {
            cfg,
            metrics,
            manager,
            pool,
            access,
            // Plugin loading is a host concern; the registry starts empty.
            plugins: Vec::new(),
            rewrite,
            cache,
            request_bucket,
            per_ip_bucket,
            per_path_bucket,
            user_conns,
            service_conns,
            congestion,
            dispatchers,
            sched_cfg,
            batchers,
            audit,
            history,
            accept_gate,
            acme_dir,
            settings: Mutex::new(settings),
            config_path,
        });

        Ok(Self {
            ctx,
            listen_port,
            reuse_port,
            shards,
            tls,
            l4_port,
            udp_cfg,
            health_cfg,
            ai_cfg,
            warmup_cfg,
        })
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Bind listeners, spawn the control plane, return the handle.
    pub async fn start(self) -> Result<RunningProxy, ProxyError> {
        let ctx = self.ctx;
        let mut tasks = Vec::new();

        if let Some(cfg) = self.health_cfg {
            tasks.push(strip(ctx.manager.start_health_check(cfg)));
        }
        if let Some(cfg) = self.ai_cfg {
            tasks.push(strip(ctx.manager.start_ai_check(cfg)));
        }
        if let Some(cfg) = self.warmup_cfg {
            tasks.push(strip(ctx.manager.start_warmup(cfg)));
        }
        if let Some(history) = &ctx.history {
            tasks.push(strip(history.start()));
        }
        if let Some(cfg) = self.udp_cfg {
            let handle = udp::spawn(cfg, Arc::clone(&ctx.manager), Arc::clone(&ctx.metrics));
            tasks.push(tokio::spawn(async move {
                if let Ok(Err(err)) = handle.await {
                    warn!(%err, "udp proxy exited");
                }
            }));
        }
        if let Some(port) = self.l4_port {
            tasks.push(spawn_l4(Arc::clone(&ctx), port, self.reuse_port)?);
        }

        let addr: SocketAddr = ([0, 0, 0, 0], self.listen_port).into();
        let listener = listener::bind_tcp(addr, self.reuse_port)?;
        let l7_addr = listener.local_addr()?;
        info!(%l7_addr, shards = self.shards, tls = self.tls.is_some(), "l7 listener up");

        let accept_ctx = Arc::clone(&ctx);
        let tls = self.tls;
        let shards = self.shards;
        tasks.push(tokio::spawn(async move {
            let next_shard = AtomicUsize::new(0);
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let permit = match accept_ctx.accept_gate.check(&peer.ip().to_string()) {
                    AcceptDecision::Admit(permit) => permit,
                    AcceptDecision::Deny(reason) => {
                        accept_ctx.metrics.add_ddos_drops(1);
                        tracing::debug!(%peer, ?reason, "connection refused at accept");
                        continue; // socket drops here
                    }
                };
                let shard = next_shard.fetch_add(1, Ordering::Relaxed) % shards;
                let conn_ctx = Arc::clone(&accept_ctx);
                let tls = tls.clone();
                tokio::spawn(async move {
                    let _ = socket.set_nodelay(true);
                    match net::tls::maybe_terminate(socket, tls.as_ref()).await {
                        Ok(stream) => {
                            session::serve_connection(conn_ctx, stream, shard, permit).await;
                        }
                        Err(err) => {
                            tracing::debug!(%err, "tls handshake failed");
                            drop(permit);
                        }
                    }
                });
            }
        }));

        Ok(RunningProxy { l7_addr, ctx, tasks })
    }

    /// Start and park forever (the binary's serve path).
    pub async fn run(self) -> Result<(), ProxyError> {
        let running = self.start().await?;
        running.wait().await;
        Ok(())
    }
}

fn spawn_l4(ctx: Arc<ProxyContext>, port: u16, reuse_port: bool) -> Result<JoinHandle<()>, ProxyError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = listener::bind_tcp(addr, reuse_port)?;
    info!(port, "l4 listener up");
    Ok(tokio::spawn(async move {
        loop {
            let (mut client, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let permit = match ctx.accept_gate.check(&peer.ip().to_string()) {
                AcceptDecision::Admit(p) => p,
                AcceptDecision::Deny(_) => {
                    ctx.metrics.add_ddos_drops(1);
                    continue;
                }
            };
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let _permit = permit;
                let key = format!("l4#{}", peer.ip());
                let backend = match ctx.manager.select(&key) {
                    Some(b) => b,
                    None => return,
                };
                ctx.metrics.conn_opened();
                match tokio::net::TcpStream::connect((backend.ip.as_str(), backend.port)).await {
                    Ok(mut upstream) => {
                        ctx.manager.on_conn_start(&backend.id());
                        let _ = session::tunnel::splice(&mut client, &mut upstream, &ctx.metrics).await;
                        ctx.manager.on_conn_end(&backend.id());
                    }
                    Err(_) => {
                        ctx.manager.report_failure(&backend.id());
                        ctx.metrics.inc_backend_failures();
                    }
                }
                ctx.metrics.conn_closed();
            });
        }
    }))
}

/// `[rewrite]` entries: each value is a whitespace-separated rule
/// description, e.g.
/// `prefix:/api method:POST reqset:X-Env=prod reqdel:X-Debug
///  reqbody:old=>new respset:X-Served=trellis respdel:Server
///  respbody:secret=>***`
fn parse_rewrite_rules(settings: &Settings) -> Vec<RewriteRule> {
    let mut rules = Vec::new();
    for (name, value) in settings.section("rewrite") {
        let mut rule = RewriteRule::default();
        for token in value.split_whitespace() {
            let Some((kind, arg)) = token.split_once(':') else {
                continue;
            };
            match kind {
                "prefix" => rule.path_prefix = arg.to_string(),
                "method" => rule.method = arg.to_ascii_uppercase(),
                "reqset" => {
                    if let Some((k, v)) = arg.split_once('=') {
                        rule.req_set_headers.push((k.to_string(), v.to_string()));
                    }
                }
                "reqdel" => rule.req_del_headers.push(arg.to_string()),
                "reqbody" => {
                    if let Some((from, to)) = arg.split_once("=>") {
                        rule.req_body_replaces.push((from.to_string(), to.to_string()));
                    }
                }
                "respset" => {
                    if let Some((k, v)) = arg.split_once('=') {
                        rule.resp_set_headers.push((k.to_string(), v.to_string()));
                    }
                }
                "respdel" => rule.resp_del_headers.push(arg.to_string()),
                "respbody" => {
                    if let Some((from, to)) = arg.split_once("=>") {
                        rule.resp_body_replaces.push((from.to_string(), to.to_string()));
                    }
                }
                _ => warn!(rule = %name, token, "unknown rewrite token"),
            }
        }
        if rule.path_prefix.is_empty() {
            warn!(rule = %name, "rewrite rule without prefix skipped");
            continue;
        }
        rules.push(rule);
    }
    rules
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.01))
}

fn strip<T: Send + 'static>(handle: JoinHandle<T>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = handle.await;
    })
}
