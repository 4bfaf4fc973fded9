//! Locally-answered admin endpoints.
//!
//! Protocol-agnostic: handlers return an [`AdminReply`] and the HTTP/1
//! and HTTP/2 loops wrap it in their own framing. Mutating endpoints go
//! to the audit log.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::session::ProxyContext;

/// A locally-produced response.
#[derive(Debug, Clone)]
pub struct AdminReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl AdminReply {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    fn bad_request(msg: &str) -> Self {
        Self::json(400, json!({"error": msg}))
    }

    fn not_found() -> Self {
        Self::json(404, json!({"error": "unknown backend"}))
    }
}

/// Value of `name` in an urlencoded query string.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

const ACME_PREFIX: &str = "/.well-known/acme-challenge/";

/// Try to answer `method path?query` locally. `None` means the request
/// is not an admin request and continues to the proxy path.
pub async fn handle(
    ctx: &Arc<ProxyContext>,
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
    peer_ip: &str,
) -> Option<AdminReply> {
    if let Some(token) = path.strip_prefix(ACME_PREFIX) {
        return Some(serve_acme(ctx, token).await);
    }

    let reply = match (method, path) {
        ("GET", "/stats") => AdminReply {
            status: 200,
            content_type: "application/json",
            body: ctx.metrics.to_json(&ctx.manager.snapshot()).into_bytes(),
        },
        ("GET", "/history") => {
            let seconds = query_param(query, "seconds")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60u64);
            match &ctx.history {
                Some(history) => AdminReply {
                    status: 200,
                    content_type: "application/json",
                    body: history.points_json(seconds).into_bytes(),
                },
                None => AdminReply::json(200, json!({"points": []})),
            }
        }
        ("GET", "/history/summary") => {
            let seconds = query_param(query, "seconds")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60u64);
            match &ctx.history {
                Some(history) => AdminReply {
                    status: 200,
                    content_type: "application/json",
                    body: history.summary_json(seconds).into_bytes(),
                },
                None => AdminReply::json(200, json!({"seconds": seconds, "samples": 0})),
            }
        }
        ("GET", "/admin/config") => dump_config(ctx, query),
        ("POST", "/admin/config") => apply_config(ctx, body, peer_ip),
        ("POST", "/admin/backend_metrics") => backend_metrics(ctx, body),
        ("POST", "/admin/backend_model") => backend_model(ctx, body, peer_ip),
        ("POST", "/admin/backend_register") => backend_register(ctx, body, peer_ip),
        ("POST", "/admin/backend_remove") => backend_remove(ctx, body, peer_ip),
        ("POST", "/admin/backend_online") => backend_online(ctx, body, peer_ip),
        ("POST", "/admin/backend_weight") => backend_weight(ctx, body, peer_ip),
        ("GET", "/admin/logs") => admin_logs(ctx, query),
        ("GET", "/admin/diagnose") => diagnose(ctx),
        _ => return None,
    };
    Some(reply)
}

async fn serve_acme(ctx: &Arc<ProxyContext>, token: &str) -> AdminReply {
    let dir = match &ctx.acme_dir {
        Some(dir) => dir,
        None => return AdminReply::text(404, "acme disabled"),
    };
    // Token is a single path component; anything else is traversal.
    if token.is_empty() || token.contains('/') || token.contains("..") {
        return AdminReply::text(404, "bad token");
    }
    match tokio::fs::read(dir.join(token)).await {
        Ok(content) => AdminReply {
            status: 200,
            content_type: "text/plain",
            body: content,
        },
        Err(_) => AdminReply::text(404, "unknown token"),
    }
}

fn dump_config(ctx: &Arc<ProxyContext>, query: &str) -> AdminReply {
    let settings = ctx.settings.lock();
    if query_param(query, "format") == Some("ini") {
        return AdminReply::text(200, settings.dump());
    }
    let mut sections = serde_json::Map::new();
    for name in settings.section_names() {
        let entries: serde_json::Map<String, serde_json::Value> = settings
            .section(&name)
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        sections.insert(name, serde_json::Value::Object(entries));
    }
    AdminReply::json(200, serde_json::Value::Object(sections))
}

fn apply_config(ctx: &Arc<ProxyContext>, body: &[u8], peer_ip: &str) -> AdminReply {
    // JSON update batch, or a raw INI body as a full replacement.
    let applied = if let Ok(req) = serde_json::from_slice::<trellis_config::ConfigUpdateRequest>(body)
    {
        let mut settings = ctx.settings.lock();
        let applied = settings.apply_updates(&req.updates, &req.deletes);
        if req.save == 1 {
            if let Some(path) = &ctx.config_path {
                if let Err(err) = settings.save_file(path) {
                    return AdminReply::json(500, json!({"error": err.to_string()}));
                }
            }
        }
        applied
    } else {
        match std::str::from_utf8(body)
            .ok()
            .and_then(|text| trellis_config::Settings::parse(text).ok())
        {
            Some(parsed) => {
                let count = parsed.section_names().len();
                *ctx.settings.lock() = parsed;
                count
            }
            None => return AdminReply::bad_request("body is neither an update batch nor INI"),
        }
    };
    ctx.audit
        .record(&format!("admin config_update peer={peer_ip} applied={applied}"));
    info!(peer = %peer_ip, applied, "admin config update");
    AdminReply::json(200, json!({"applied": applied}))
}

#[derive(Deserialize)]
struct MetricsBody {
    backend: String,
    #[serde(default = "neg_one")]
    queue_len: i64,
    #[serde(default = "neg_one_f")]
    gpu_util: f64,
    #[serde(default = "neg_one")]
    vram_used_mb: i64,
    #[serde(default = "neg_one")]
    vram_total_mb: i64,
}

fn neg_one() -> i64 {
    -1
}
fn neg_one_f() -> f64 {
    -1.0
}

fn backend_metrics(ctx: &Arc<ProxyContext>, body: &[u8]) -> AdminReply {
    let req: MetricsBody = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return AdminReply::bad_request(&e.to_string()),
    };
    if ctx.manager.update_metrics(
        &req.backend,
        req.queue_len,
        req.gpu_util,
        req.vram_used_mb,
        req.vram_total_mb,
    ) {
        AdminReply::json(200, json!({"ok": true}))
    } else {
        AdminReply::not_found()
    }
}

#[derive(Deserialize)]
struct ModelBody {
    backend: String,
    model: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default = "default_true")]
    loaded: bool,
}

fn default_true() -> bool {
    true
}

fn backend_model(ctx: &Arc<ProxyContext>, body: &[u8], peer_ip: &str) -> AdminReply {
    let req: ModelBody = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return AdminReply::bad_request(&e.to_string()),
    };
    if ctx
        .manager
        .set_loaded_model(&req.backend, &req.model, req.version.as_deref(), req.loaded)
    {
        ctx.audit.record(&format!(
            "admin backend_model peer={peer_ip} backend={} model={} loaded={}",
            req.backend, req.model, req.loaded
        ));
        AdminReply::json(200, json!({"ok": true}))
    } else {
        AdminReply::not_found()
    }
}

#[derive(Deserialize)]
struct RegisterBody {
    ip: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    1
}

fn backend_register(ctx: &Arc<ProxyContext>, body: &[u8], peer_ip: &str) -> AdminReply {
    let req: RegisterBody = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return AdminReply::bad_request(&e.to_string()),
    };
    if req.port == 0 {
        return AdminReply::bad_request("port must be non-zero");
    }
    ctx.manager.add(&req.ip, req.port, req.weight);
    ctx.audit.record(&format!(
        "admin backend_register peer={peer_ip} backend={}:{} weight={}",
        req.ip, req.port, req.weight
    ));
    AdminReply::json(200, json!({"ok": true}))
}

#[derive(Deserialize)]
struct BackendIdBody {
    backend: String,
}

fn backend_remove(ctx: &Arc<ProxyContext>, body: &[u8], peer_ip: &str) -> AdminReply {
    let req: BackendIdBody = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return AdminReply::bad_request(&e.to_string()),
    };
    if ctx.manager.remove(&req.backend) {
        ctx.audit
            .record(&format!("admin backend_remove peer={peer_ip} backend={}", req.backend));
        AdminReply::json(200, json!({"ok": true}))
    } else {
        AdminReply::not_found()
    }
}

#[derive(Deserialize)]
struct OnlineBody {
    backend: String,
    online: bool,
}

fn backend_online(ctx: &Arc<ProxyContext>, body: &[u8], peer_ip: &str) -> AdminReply {
    let req: OnlineBody = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return AdminReply::bad_request(&e.to_string()),
    };
    if ctx.manager.set_online(&req.backend, req.online) {
        ctx.audit.record(&format!(
            "admin backend_online peer={peer_ip} backend={} online={}",
            req.backend, req.online
        ));
        AdminReply::json(200, json!({"ok": true}))
    } else {
        AdminReply::not_found()
    }
}

#[derive(Deserialize)]
struct WeightBody {
    backend: String,
    base_weight: u32,
}

fn backend_weight(ctx: &Arc<ProxyContext>, body: &[u8], peer_ip: &str) -> AdminReply {
    let req: WeightBody = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return AdminReply::bad_request(&e.to_string()),
    };
    if ctx.manager.set_base_weight(&req.backend, req.base_weight) {
        ctx.audit.record(&format!(
            "admin backend_weight peer={peer_ip} backend={} base_weight={}",
            req.backend, req.base_weight
        ));
        AdminReply::json(200, json!({"ok": true}))
    } else {
        AdminReply::not_found()
    }
}

fn admin_logs(ctx: &Arc<ProxyContext>, query: &str) -> AdminReply {
    if query_param(query, "type") != Some("audit") {
        return AdminReply::bad_request("unsupported log type");
    }
    let lines = query_param(query, "lines")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100usize);
    AdminReply::text(200, ctx.audit.tail(lines).join("\n"))
}

fn diagnose(ctx: &Arc<ProxyContext>) -> AdminReply {
    let congestion = ctx.congestion.stats();
    AdminReply::json(
        200,
        json!({
            "stats": serde_json::from_str::<serde_json::Value>(
                &ctx.metrics.to_json(&ctx.manager.snapshot())
            ).unwrap_or(json!({})),
            "pool": ctx.pool.stats_json(),
            "scheduler": {
                "queued": ctx.dispatchers.total_queued(),
                "inflight": ctx.dispatchers.total_inflight(),
            },
            "congestion": {
                "cwnd": congestion.cwnd,
                "inflight": congestion.inflight,
                "acks": congestion.acks,
                "losses": congestion.losses,
            },
            "limiters": {
                "per_ip_keys": ctx.per_ip_bucket.len(),
                "per_path_keys": ctx.per_path_bucket.len(),
                "user_conn_keys": ctx.user_conns.len(),
                "service_conn_keys": ctx.service_conns.len(),
            },
            "accept": {
                "drops": ctx.accept_gate.drops(),
                "active": ctx.accept_gate.active(),
            },
        }),
    )
}
