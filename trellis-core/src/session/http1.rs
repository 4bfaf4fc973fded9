//! The HTTP/1.1 connection loop.
//!
//! One request at a time, in arrival order: the parser consumes exactly
//! the bytes of the current request from the connection buffer, the
//! request is fully answered, and only then does the loop look at the
//! buffered remainder, so pipelined clients get their responses in
//! order and exactly once. Parse failures answer `400 Bad Request`
//! before closing, on every path.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use trellis_balance::BackendAddr;
use trellis_compression::{decompress, negotiate, Encoding};
use trellis_proto::cookie::get_cookie_value;
use trellis_proto::http1::{simple_response, Request, RequestParser};

use crate::error::ProxyError;
use crate::net::ClientStream;
use crate::sched::{SchedConfig, TaskMeta};
use crate::session::forward::{self, TransformSpec};
use crate::session::{admin, batch, service_key, tunnel, AffinityMode, ConnSlots, ProxyContext};

/// What to do with the connection after one request.
enum Disposition {
    KeepAlive,
    Close,
    /// WebSocket takeover; the upstream socket joins the splice.
    Upgrade(tokio::net::TcpStream),
}

pub async fn serve(
    ctx: &Arc<ProxyContext>,
    mut stream: ClientStream,
    peer_ip: &str,
    shard: usize,
    buf: BytesMut,
) -> Result<(), ProxyError> {
    let mut slots = ConnSlots::default();
    let result = run_loop(ctx, &mut stream, peer_ip, shard, buf, &mut slots).await;
    slots.release(ctx);

    match result {
        Ok(Some(mut upstream)) => {
            tunnel::splice(&mut stream, &mut upstream, &ctx.metrics).await?;
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Returns the upstream socket when the connection upgraded to a tunnel.
async fn run_loop(
    ctx: &Arc<ProxyContext>,
    stream: &mut ClientStream,
    peer_ip: &str,
    shard: usize,
    mut buf: BytesMut,
    slots: &mut ConnSlots,
) -> Result<Option<tokio::net::TcpStream>, ProxyError> {
    let mut parser = RequestParser::new();
    loop {
        match parser.parse(&mut buf) {
            Err(err) => {
                debug!(peer = %peer_ip, %err, "request parse failed");
                ctx.audit.record(&format!("parse_error peer={peer_ip}"));
                let reply = simple_response(400, "text/plain", b"Bad Request", true);
                let _ = stream.write_all(&reply).await;
                return Ok(None);
            }
            Ok(Some(request)) => {
                match handle_request(ctx, stream, peer_ip, shard, slots, request).await? {
                    Disposition::KeepAlive => continue,
                    Disposition::Close => return Ok(None),
                    Disposition::Upgrade(mut upstream) => {
                        // Client bytes already buffered past the upgrade
                        // request belong to the tunnel.
                        if !buf.is_empty() {
                            upstream.write_all(&buf).await?;
                        }
                        return Ok(Some(upstream));
                    }
                }
            }
            Ok(None) => {
                let n = match timeout(ctx.cfg.client_idle, stream.read_buf(&mut buf)).await {
                    Ok(Ok(n)) => n,
                    // Idle timeout or socket error both end the connection.
                    Ok(Err(_)) | Err(_) => return Ok(None),
                };
                if n == 0 {
                    return Ok(None);
                }
                ctx.metrics.add_bytes_in(n as u64);
            }
        }
    }
}

async fn handle_request(
    ctx: &Arc<ProxyContext>,
    stream: &mut ClientStream,
    peer_ip: &str,
    shard: usize,
    slots: &mut ConnSlots,
    mut request: Request,
) -> Result<Disposition, ProxyError> {
    let started = Instant::now();
    ctx.metrics.inc_total_requests();
    ctx.metrics.record_method(&request.method);
    ctx.metrics.record_path(&request.path);
    let client_keep_alive = request.keeps_alive();

    // ------------------------------------------------------------------
    // 1. Admission
    // ------------------------------------------------------------------
    let rate_ok = ctx.request_bucket.allow(1.0)
        && ctx.per_ip_bucket.allow(peer_ip)
        && ctx.per_path_bucket.allow(&request.path);
    if !rate_ok {
        ctx.metrics.add_ddos_drops(1);
        ctx.audit
            .record(&format!("deny rate peer={peer_ip} path={}", request.path));
        return reply_and_close(ctx, stream, 429, b"Too Many Requests").await;
    }

    let user_key = request
        .headers
        .get(&ctx.cfg.user_header)
        .unwrap_or(peer_ip)
        .to_string();
    if !slots.acquire_once(ctx, &user_key, service_key(&request.path)) {
        ctx.audit
            .record(&format!("deny conn_slots peer={peer_ip} user={user_key}"));
        return reply_and_close(ctx, stream, 429, b"Too Many Connections").await;
    }

    if !ctx.access.is_noop() {
        let token = request.headers.get(ctx.access.token_header());
        let api_key = request.headers.get(ctx.access.api_key_header());
        if !ctx.access.allow(peer_ip, token, api_key) {
            ctx.audit.record(&format!("deny acl peer={peer_ip}"));
            return reply_and_close(ctx, stream, 403, b"Forbidden").await;
        }
    }

    // ------------------------------------------------------------------
    // 2. Plugin dispatch
    // ------------------------------------------------------------------
    for plugin in &ctx.plugins {
        if let Some(reply) = plugin.handle(&request, peer_ip).await {
            debug!(plugin = plugin.name(), "request answered by plugin");
            let wire = simple_response(reply.status, "text/plain", &reply.body, true);
            let wire = rebuild_with_content_type(wire, &reply.content_type);
            write_reply(ctx, stream, &wire).await?;
            return Ok(Disposition::Close);
        }
    }

    // ------------------------------------------------------------------
    // 3. Locally answered: admin surface + ACME
    // ------------------------------------------------------------------
    if let Some(reply) = admin::handle(
        ctx,
        &request.method,
        &request.path,
        &request.query,
        &request.body,
        peer_ip,
    )
    .await
    {
        let wire = simple_response(reply.status, reply.content_type, &reply.body, !client_keep_alive);
        write_reply(ctx, stream, &wire).await?;
        ctx.metrics
            .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
        return Ok(keep_or_close(client_keep_alive));
    }

    // ------------------------------------------------------------------
    // 4. Routing: model extraction, affinity key, backend selection
    // ------------------------------------------------------------------
    let model = header_or_query(&request, &ctx.cfg.model_header, "model");
    let version = header_or_query(&request, &ctx.cfg.model_version_header, "model_version");
    if let Some(model) = &model {
        ctx.metrics.record_model(model);
    }

    let affinity_key = affinity_key(ctx, &request, peer_ip);
    let mut selection_key = format!("{}#{}", request.path, affinity_key);
    if let Some(m) = &model {
        selection_key.push_str(&format!("#model:{m}"));
    }
    if let Some(v) = &version {
        selection_key.push_str(&format!("#ver:{v}"));
    }

    let backend = select_backend(ctx, &selection_key, model.as_deref(), version.as_deref());
    let backend = match backend {
        Some(b) => b,
        None => {
            ctx.metrics.inc_backend_failures();
            return reply_and_close(ctx, stream, 503, b"Service Unavailable").await;
        }
    };
    trace!(peer = %peer_ip, backend = %backend, key = %selection_key, "backend selected");

    // ------------------------------------------------------------------
    // 5. Cache lookup
    // ------------------------------------------------------------------
    let cacheable = ctx.cfg.cache_enabled
        && ctx.cache.is_some()
        && request.method == "GET"
        && request.body.is_empty()
        && !request.headers.contains("content-encoding");
    let cache_key = cacheable.then(|| {
        let mut key = format!("GET {}", request.target());
        if let Some(m) = &model {
            key.push_str(&format!("#model:{m}"));
        }
        if let Some(v) = &version {
            key.push_str(&format!("#ver:{v}"));
        }
        key
    });
    if let (Some(cache), Some(key)) = (&ctx.cache, &cache_key) {
        if let Some(hit) = cache.lookup(key).await {
            trace!(key = %key, "cache hit");
            let wire = simple_response(hit.status, "application/octet-stream", &hit.body, !client_keep_alive);
            // simple_response pins text/plain content types; rebuild with
            // the stored one.
            let wire = rebuild_with_content_type(wire, &hit.content_type);
            write_reply(ctx, stream, &wire).await?;
            ctx.metrics
                .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
            return Ok(keep_or_close(client_keep_alive));
        }
    }

    // ------------------------------------------------------------------
    // 6. WebSocket upgrade -> tunnel takeover
    // ------------------------------------------------------------------
    if is_websocket_upgrade(&request) {
        debug!(peer = %peer_ip, backend = %backend, "websocket upgrade");
        let mut lease = match ctx.pool.acquire(&backend).await {
            Ok(lease) => lease,
            Err(err) => {
                debug!(backend = %backend, %err, "websocket upstream connect failed");
                ctx.manager.report_failure(&backend.id());
                ctx.metrics.inc_backend_failures();
                return reply_and_close(ctx, stream, 502, b"Bad Gateway").await;
            }
        };
        // The original upgrade request goes to the backend verbatim; the
        // socket never returns to the pool.
        let wire = request.to_wire();
        if lease.stream.write_all(&wire).await.is_err() {
            ctx.manager.report_failure(&backend.id());
            return reply_and_close(ctx, stream, 502, b"Bad Gateway").await;
        }
        let upstream = lease.into_stream();
        return Ok(Disposition::Upgrade(upstream));
    }

    // ------------------------------------------------------------------
    // 7. Normalize: request body decompression
    // ------------------------------------------------------------------
    if let Some(encoding) = request
        .headers
        .get("content-encoding")
        .and_then(Encoding::parse)
    {
        if !encoding.is_identity() {
            match decompress(encoding, &request.body) {
                Ok(body) => {
                    request.body = body;
                    request.headers.remove("content-encoding");
                }
                Err(_) => {
                    return reply_and_close(ctx, stream, 400, b"Bad Request").await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 8. Batch split
    // ------------------------------------------------------------------
    if request.method == "POST" && is_truthy(request.headers.get("x-batch-split")) {
        if let Some(items) = batch::split_json_array_items(&request.body) {
            if !items.is_empty() && items.len() <= batch::MAX_SPLIT_ITEMS {
                let body =
                    batch::split_and_reply(ctx, &backend, &request.target(), items, peer_ip).await;
                let wire = simple_response(200, "application/json", &body, !client_keep_alive);
                write_reply(ctx, stream, &wire).await?;
                ctx.metrics
                    .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
                return Ok(keep_or_close(client_keep_alive));
            }
        }
    }

    // ------------------------------------------------------------------
    // 9. Rewrite + encoding intent
    // ------------------------------------------------------------------
    let rule_idx = ctx.rewrite.match_rule(&request.method, &request.path);
    if let Some(idx) = rule_idx {
        ctx.rewrite.apply_request(idx, &mut request);
    }
    let client_encoding = negotiate(request.headers.get("accept-encoding"));

    // ------------------------------------------------------------------
    // 10. Batcher enqueue
    // ------------------------------------------------------------------
    if let Some(batchers) = &ctx.batchers {
        let header_value = request.headers.get(&batchers.config().header_name);
        if batchers
            .config()
            .is_batchable(&request.method, &request.path, header_value)
        {
            if let Some(rx) = batchers.for_shard(shard).enqueue(
                ctx,
                backend.clone(),
                request.target(),
                peer_ip,
                request.body.clone(),
            ) {
                let batched = timeout(ctx.cfg.upstream_wait, rx).await;
                let (status, body) = match batched {
                    Ok(Ok(reply)) => reply,
                    _ => (502, b"batch timed out".to_vec()),
                };
                let wire = simple_response(status, "application/json", &body, !client_keep_alive);
                write_reply(ctx, stream, &wire).await?;
                ctx.metrics
                    .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
                return Ok(keep_or_close(client_keep_alive));
            }
        }
    }

    // ------------------------------------------------------------------
    // 11. Forward, under congestion + scheduling control
    // ------------------------------------------------------------------
    if !ctx.congestion.try_acquire() {
        ctx.congestion.on_drop();
        ctx.audit.record(&format!("deny congestion peer={peer_ip}"));
        return reply_and_close(ctx, stream, 503, b"Service Unavailable").await;
    }

    let is_head = request.method == "HEAD";
    normalize_upstream_request_in_place(&mut request, peer_ip);
    let wire = request.to_wire();
    let spec = TransformSpec {
        rule_idx,
        client_encoding,
        cache_key,
        client_keep_alive,
    };
    let meta = task_meta(&ctx.sched_cfg, &request, peer_ip);
    let dispatcher = ctx.dispatchers.for_shard(shard);
    let outcome = dispatcher
        .run(
            meta,
            forward::forward_streaming(ctx, &backend, &wire, is_head, spec, stream),
        )
        .await;

    ctx.congestion
        .on_complete(outcome.as_ref().map(|o| o.success).unwrap_or(false));
    ctx.metrics
        .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);

    match outcome {
        Ok(o) => {
            if o.client_close || !client_keep_alive {
                Ok(Disposition::Close)
            } else {
                Ok(Disposition::KeepAlive)
            }
        }
        Err(err) => {
            debug!(peer = %peer_ip, %err, "forward failed");
            match err.reply_status() {
                Some(status) => {
                    let reply =
                        simple_response(status, "text/plain", status_body(status), true);
                    let _ = stream.write_all(&reply).await;
                    Ok(Disposition::Close)
                }
                None => Ok(Disposition::Close),
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn reply_and_close(
    ctx: &Arc<ProxyContext>,
    stream: &mut ClientStream,
    status: u16,
    body: &[u8],
) -> Result<Disposition, ProxyError> {
    let wire = simple_response(status, "text/plain", body, true);
    write_reply(ctx, stream, &wire).await?;
    Ok(Disposition::Close)
}

async fn write_reply(
    ctx: &Arc<ProxyContext>,
    stream: &mut ClientStream,
    wire: &[u8],
) -> Result<(), ProxyError> {
    stream.write_all(wire).await?;
    ctx.metrics.add_bytes_out(wire.len() as u64);
    Ok(())
}

fn keep_or_close(keep_alive: bool) -> Disposition {
    if keep_alive {
        Disposition::KeepAlive
    } else {
        Disposition::Close
    }
}

fn status_body(status: u16) -> &'static [u8] {
    match status {
        400 => b"Bad Request",
        502 => b"Bad Gateway",
        503 => b"Service Unavailable",
        _ => b"",
    }
}

fn header_or_query(request: &Request, header: &str, query_name: &str) -> Option<String> {
    request
        .headers
        .get(header)
        .map(str::to_string)
        .or_else(|| request.query_param(query_name).map(str::to_string))
        .filter(|v| !v.is_empty())
}

fn affinity_key(ctx: &ProxyContext, request: &Request, peer_ip: &str) -> String {
    let derived = match ctx.cfg.affinity_mode {
        AffinityMode::Ip => Some(peer_ip.to_string()),
        AffinityMode::Header => request
            .headers
            .get(&ctx.cfg.affinity_header)
            .map(str::to_string),
        AffinityMode::Cookie => request
            .headers
            .get("cookie")
            .and_then(|c| get_cookie_value(c, &ctx.cfg.affinity_cookie))
            .map(str::to_string),
    };
    derived
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| peer_ip.to_string())
}

fn select_backend(
    ctx: &ProxyContext,
    key: &str,
    model: Option<&str>,
    version: Option<&str>,
) -> Option<BackendAddr> {
    match (model, version) {
        (Some(m), Some(v)) => ctx.manager.select_for_model_version(key, m, v),
        (Some(m), None) => ctx.manager.select_for_model(key, m),
        _ => ctx.manager.select(key),
    }
}

fn is_websocket_upgrade(request: &Request) -> bool {
    request.headers.contains_token("connection", "upgrade")
        && request
            .headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        && request.headers.contains("sec-websocket-key")
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "yes" | "on"))
}

fn normalize_upstream_request_in_place(request: &mut Request, peer_ip: &str) {
    forward::normalize_upstream_request(request, peer_ip, None);
}

fn task_meta(cfg: &SchedConfig, request: &Request, peer_ip: &str) -> TaskMeta {
    let priority = request
        .headers
        .get(&cfg.priority_header)
        .map(str::to_string)
        .or_else(|| request.query_param(&cfg.priority_query).map(str::to_string))
        .and_then(|v| v.parse::<u8>().ok())
        .map(|p| p.min(9))
        .unwrap_or(5);
    let flow = request
        .headers
        .get(&cfg.flow_header)
        .map(str::to_string)
        .or_else(|| request.query_param(&cfg.flow_query).map(str::to_string))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer_ip.to_string());
    let deadline = request
        .headers
        .get(&cfg.deadline_header)
        .map(str::to_string)
        .or_else(|| request.query_param(&cfg.deadline_query).map(str::to_string))
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_millis)
        .unwrap_or(cfg.default_deadline);
    TaskMeta {
        priority,
        flow,
        deadline,
    }
}

/// Swap the default text/plain content type of `simple_response` output.
fn rebuild_with_content_type(wire: Vec<u8>, content_type: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(&wire);
    let replaced = text.replacen(
        "Content-Type: application/octet-stream",
        &format!("Content-Type: {content_type}"),
        1,
    );
    replaced.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_proto::http1::Version;
    use trellis_proto::Headers;

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut h = Headers::new();
        for (k, v) in headers {
            h.append(*k, *v);
        }
        Request {
            method: "GET".into(),
            path: "/".into(),
            query: String::new(),
            version: Version::Http11,
            headers: h,
            body: Vec::new(),
        }
    }

    #[test]
    fn test_websocket_detection() {
        let req = request_with(&[
            ("Connection", "keep-alive, Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Key", "abc=="),
        ]);
        assert!(is_websocket_upgrade(&req));

        let req = request_with(&[("Connection", "Upgrade"), ("Upgrade", "h2c")]);
        assert!(!is_websocket_upgrade(&req));

        let req = request_with(&[("Upgrade", "websocket"), ("Sec-WebSocket-Key", "x")]);
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy(Some("1")));
        assert!(is_truthy(Some("true")));
        assert!(!is_truthy(Some("0")));
        assert!(!is_truthy(None));
    }

    #[test]
    fn test_task_meta_extraction() {
        let cfg = SchedConfig::default();
        let mut req = request_with(&[("X-Priority", "8"), ("X-Flow", "tenant-1")]);
        req.query = "deadline_ms=250".into();
        let meta = task_meta(&cfg, &req, "9.9.9.9");
        assert_eq!(meta.priority, 8);
        assert_eq!(meta.flow, "tenant-1");
        assert_eq!(meta.deadline, std::time::Duration::from_millis(250));

        let bare = request_with(&[]);
        let meta = task_meta(&cfg, &bare, "9.9.9.9");
        assert_eq!(meta.priority, 5);
        assert_eq!(meta.flow, "9.9.9.9");
        assert_eq!(meta.deadline, cfg.default_deadline);
    }

    #[test]
    fn test_header_or_query() {
        let mut req = request_with(&[("X-Model", "llama")]);
        assert_eq!(header_or_query(&req, "X-Model", "model"), Some("llama".into()));
        req.headers.remove("X-Model");
        req.query = "model=phi".into();
        assert_eq!(header_or_query(&req, "X-Model", "model"), Some("phi".into()));
        req.query = String::new();
        assert_eq!(header_or_query(&req, "X-Model", "model"), None);
    }
}
