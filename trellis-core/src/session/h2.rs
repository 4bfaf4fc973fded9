//! The HTTP/2 (h2c) connection loop.
//!
//! The frame machine lives in `trellis_proto::h2`; this module owns the
//! socket. Reads feed the machine; completed requests are admitted and
//! then handled concurrently, one task per stream, with all outbound
//! frames serialized through a single writer task so responses from
//! different streams may interleave but frames never tear.
//!
//! gRPC requests (`content-type: application/grpc`) are answered by the
//! built-in Echo services or bridged to HTTP/1 upstreams by the Gateway
//! service; everything else converts to an HTTP/1.1 upstream exchange.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use trellis_compression::{compress, negotiate, Encoding};
use trellis_proto::h2::{encode_data, encode_headers, encode_response, encode_trailers, H2Request, Http2Connection};
use trellis_proto::hpack::Header;
use trellis_proto::http1::{Request, Version};
use trellis_proto::{grpc, pb, Headers};

use crate::error::ProxyError;
use crate::net::ClientStream;
use crate::sched::TaskMeta;
use crate::session::forward;
use crate::session::{admin, service_key, AffinityMode, ConnSlots, ProxyContext};

/// gRPC status codes the proxy emits.
mod grpc_status {
    pub const OK: &str = "0";
    pub const INTERNAL: &str = "13";
    pub const UNAVAILABLE: &str = "14";
    pub const UNIMPLEMENTED: &str = "12";
}

pub async fn serve(
    ctx: &Arc<ProxyContext>,
    stream: ClientStream,
    peer_ip: &str,
    shard: usize,
    initial: BytesMut,
) -> Result<(), ProxyError> {
    let (mut rd, mut wr) = tokio::io::split(stream);

    // Single writer serializes frames from all streams.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer_metrics = Arc::clone(&ctx.metrics);
    let writer = tokio::spawn(async move {
        while let Some(frames) = frame_rx.recv().await {
            if wr.write_all(&frames).await.is_err() {
                break;
            }
            writer_metrics.add_bytes_out(frames.len() as u64);
        }
        let _ = wr.shutdown().await;
    });

    let mut slots = ConnSlots::default();
    let result = read_loop(ctx, &mut rd, peer_ip, shard, initial, &frame_tx, &mut slots).await;
    slots.release(ctx);
    drop(frame_tx);
    let _ = writer.await;
    result
}

async fn read_loop(
    ctx: &Arc<ProxyContext>,
    rd: &mut (impl tokio::io::AsyncRead + Unpin),
    peer_ip: &str,
    shard: usize,
    initial: BytesMut,
    frame_tx: &mpsc::Sender<Vec<u8>>,
    slots: &mut ConnSlots,
) -> Result<(), ProxyError> {
    let mut conn = Http2Connection::new();
    let mut control = Vec::new();
    let mut requests = Vec::new();

    conn.on_data(&initial, &mut control, &mut requests)?;
    flush_control(frame_tx, &mut control).await;
    for request in requests.drain(..) {
        admit_and_spawn(ctx, request, peer_ip, shard, frame_tx, slots).await;
    }

    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match timeout(ctx.cfg.client_idle, rd.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        ctx.metrics.add_bytes_in(n as u64);
        conn.on_data(&buf[..n], &mut control, &mut requests)?;
        flush_control(frame_tx, &mut control).await;
        for request in requests.drain(..) {
            admit_and_spawn(ctx, request, peer_ip, shard, frame_tx, slots).await;
        }
    }
}

async fn flush_control(frame_tx: &mpsc::Sender<Vec<u8>>, control: &mut Vec<u8>) {
    if !control.is_empty() {
        let _ = frame_tx.send(std::mem::take(control)).await;
    }
}

/// Admission runs inline (it is synchronous and ordered); the exchange
/// itself runs in its own task so streams proceed concurrently.
async fn admit_and_spawn(
    ctx: &Arc<ProxyContext>,
    request: H2Request,
    peer_ip: &str,
    shard: usize,
    frame_tx: &mpsc::Sender<Vec<u8>>,
    slots: &mut ConnSlots,
) {
    ctx.metrics.inc_total_requests();
    ctx.metrics.record_method(&request.method);
    let path_only = request.path.split('?').next().unwrap_or("/").to_string();
    ctx.metrics.record_path(&path_only);

    let rate_ok = ctx.request_bucket.allow(1.0)
        && ctx.per_ip_bucket.allow(peer_ip)
        && ctx.per_path_bucket.allow(&path_only);
    if !rate_ok {
        ctx.metrics.add_ddos_drops(1);
        ctx.audit
            .record(&format!("deny rate peer={peer_ip} path={path_only}"));
        send_plain(frame_tx, request.stream_id, 429, b"Too Many Requests").await;
        return;
    }

    let user_key = request
        .header(&ctx.cfg.user_header)
        .unwrap_or(peer_ip)
        .to_string();
    if !slots.acquire_once(ctx, &user_key, service_key(&path_only)) {
        ctx.audit
            .record(&format!("deny conn_slots peer={peer_ip} user={user_key}"));
        send_plain(frame_tx, request.stream_id, 429, b"Too Many Connections").await;
        return;
    }

    if !ctx.access.is_noop() {
        let token = request.header(ctx.access.token_header());
        let api_key = request.header(ctx.access.api_key_header());
        if !ctx.access.allow(peer_ip, token, api_key) {
            ctx.audit.record(&format!("deny acl peer={peer_ip}"));
            send_plain(frame_tx, request.stream_id, 403, b"Forbidden").await;
            return;
        }
    }

    let ctx = Arc::clone(ctx);
    let frame_tx = frame_tx.clone();
    let peer_ip = peer_ip.to_string();
    tokio::spawn(async move {
        handle_stream(ctx, request, peer_ip, shard, frame_tx).await;
    });
}

async fn handle_stream(
    ctx: Arc<ProxyContext>,
    request: H2Request,
    peer_ip: String,
    shard: usize,
    frame_tx: mpsc::Sender<Vec<u8>>,
) {
    let started = Instant::now();
    let stream_id = request.stream_id;

    let is_grpc = request
        .header("content-type")
        .map(|ct| ct.contains("application/grpc"))
        .unwrap_or(false);
    if is_grpc {
        handle_grpc(&ctx, request, &peer_ip, &frame_tx).await;
        ctx.metrics
            .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
        return;
    }

    let (path_only, query) = match request.path.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (request.path.clone(), String::new()),
    };

    // Admin surface answers HTTP/2 clients too.
    if let Some(reply) = admin::handle(
        &ctx,
        &request.method,
        &path_only,
        &query,
        &request.body,
        &peer_ip,
    )
    .await
    {
        let headers = vec![Header::new("content-type", reply.content_type)];
        let frames = encode_response(stream_id, reply.status, &headers, &reply.body);
        let _ = frame_tx.send(frames).await;
        return;
    }

    // Routing mirrors the HTTP/1 path, with :path carrying the query.
    let model = h2_header_or_query(&request, &query, &ctx.cfg.model_header, "model");
    let version = h2_header_or_query(&request, &query, &ctx.cfg.model_version_header, "model_version");
    if let Some(model) = &model {
        ctx.metrics.record_model(model);
    }
    let affinity = h2_affinity_key(&ctx, &request, &peer_ip);
    let mut selection_key = format!("{path_only}#{affinity}");
    if let Some(m) = &model {
        selection_key.push_str(&format!("#model:{m}"));
    }
    if let Some(v) = &version {
        selection_key.push_str(&format!("#ver:{v}"));
    }
    let backend = match (model.as_deref(), version.as_deref()) {
        (Some(m), Some(v)) => ctx.manager.select_for_model_version(&selection_key, m, v),
        (Some(m), None) => ctx.manager.select_for_model(&selection_key, m),
        _ => ctx.manager.select(&selection_key),
    };
    let backend = match backend {
        Some(b) => b,
        None => {
            ctx.metrics.inc_backend_failures();
            send_plain(&frame_tx, stream_id, 503, b"Service Unavailable").await;
            return;
        }
    };
    trace!(stream_id, backend = %backend, "h2 stream routed");

    if !ctx.congestion.try_acquire() {
        ctx.congestion.on_drop();
        send_plain(&frame_tx, stream_id, 503, b"Service Unavailable").await;
        return;
    }

    let wire = match to_upstream_wire(&ctx, &request, &peer_ip) {
        Some(w) => w,
        None => {
            ctx.congestion.on_complete(false);
            send_plain(&frame_tx, stream_id, 400, b"Bad Request").await;
            return;
        }
    };
    let is_head = request.method == "HEAD";
    let meta = h2_task_meta(&ctx, &request, &query, &peer_ip);
    let dispatcher = ctx.dispatchers.for_shard(shard);
    let result = dispatcher
        .run(
            meta,
            forward::fetch_buffered(&ctx, &backend, &wire, is_head, ctx.cfg.transform_max_bytes),
        )
        .await;
    ctx.congestion.on_complete(result.is_ok());
    ctx.metrics
        .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok((head, mut body)) => {
            let mut headers = Headers::new();
            if let Some(ct) = head.headers.get("content-type") {
                headers.set("content-type", ct);
            }
            // Response-side rewrite, then client-facing encoding.
            if let Some(rule_idx) = ctx.rewrite.match_rule(&request.method, &path_only) {
                ctx.rewrite.apply_response(rule_idx, &mut headers, &mut body);
            }
            let client_encoding = negotiate(request.header("accept-encoding"));
            let mut out_headers: Vec<Header> = headers
                .iter()
                .map(|(n, v)| Header::new(n.to_ascii_lowercase(), v))
                .collect();
            let wire_body = match client_encoding {
                Encoding::Identity => body,
                other => match compress(other, &body) {
                    Ok(encoded) => {
                        out_headers.push(Header::new("content-encoding", other.as_str()));
                        encoded
                    }
                    Err(_) => body,
                },
            };
            let frames = encode_response(stream_id, head.status, &out_headers, &wire_body);
            let _ = frame_tx.send(frames).await;
        }
        Err(err) => {
            debug!(stream_id, %err, "h2 upstream exchange failed");
            let status = err.reply_status().unwrap_or(502);
            send_plain(&frame_tx, stream_id, status, b"").await;
        }
    }
}

// ============================================================================
// gRPC built-ins
// ============================================================================

async fn handle_grpc(
    ctx: &Arc<ProxyContext>,
    request: H2Request,
    peer_ip: &str,
    frame_tx: &mpsc::Sender<Vec<u8>>,
) {
    let stream_id = request.stream_id;
    let messages = match grpc::decode_messages(&request.body) {
        Ok(msgs) => msgs,
        Err(err) => {
            warn!(stream_id, %err, "bad grpc framing");
            send_grpc_error(frame_tx, stream_id, grpc_status::INTERNAL).await;
            return;
        }
    };

    match request.path.as_str() {
        "/proxy.Echo/Unary" => {
            let payload = first_string(&messages);
            let reply = grpc::encode_message(&pb::encode_string_field1(&payload));
            send_grpc_ok(frame_tx, stream_id, vec![reply]).await;
        }
        "/proxy.Echo/Stream" => {
            // One reply message per request message.
            let frames: Vec<Vec<u8>> = messages
                .iter()
                .map(|m| {
                    let s = pb::decode_string_field1(m).unwrap_or_default();
                    grpc::encode_message(&pb::encode_string_field1(&s))
                })
                .collect();
            send_grpc_ok(frame_tx, stream_id, frames).await;
        }
        "/proxy.Gateway/HttpUnary" => {
            gateway_http_unary(ctx, stream_id, &messages, peer_ip, frame_tx).await;
        }
        other => {
            debug!(stream_id, path = other, "unknown grpc service");
            send_grpc_error(frame_tx, stream_id, grpc_status::UNIMPLEMENTED).await;
        }
    }
}

/// Bridge: protobuf field #1 names the backend HTTP path; the HTTP/1
/// response body comes back as the reply message.
async fn gateway_http_unary(
    ctx: &Arc<ProxyContext>,
    stream_id: u32,
    messages: &[Vec<u8>],
    peer_ip: &str,
    frame_tx: &mpsc::Sender<Vec<u8>>,
) {
    let target = messages
        .first()
        .and_then(|m| pb::decode_string_field1(m))
        .and_then(|b| String::from_utf8(b).ok())
        .unwrap_or_default();
    if target.is_empty() || !target.starts_with('/') {
        send_grpc_error(frame_tx, stream_id, grpc_status::INTERNAL).await;
        return;
    }

    let selection_key = format!("{target}#{peer_ip}");
    let backend = match ctx.manager.select(&selection_key) {
        Some(b) => b,
        None => {
            ctx.metrics.inc_backend_failures();
            send_grpc_error(frame_tx, stream_id, grpc_status::UNAVAILABLE).await;
            return;
        }
    };

    let wire = gateway_request_wire(&target, peer_ip);
    match forward::fetch_buffered(ctx, &backend, &wire, false, ctx.cfg.transform_max_bytes).await {
        Ok((head, body)) => {
            let status = if (200..400).contains(&head.status) {
                grpc_status::OK
            } else {
                grpc_status::INTERNAL
            };
            let reply = grpc::encode_message(&pb::encode_string_field1(&body));
            send_grpc_frames(frame_tx, stream_id, vec![reply], status).await;
        }
        Err(ProxyError::BackendConnect(_)) | Err(ProxyError::NoBackend) => {
            send_grpc_error(frame_tx, stream_id, grpc_status::UNAVAILABLE).await;
        }
        Err(err) => {
            debug!(stream_id, %err, "gateway upstream failed");
            send_grpc_error(frame_tx, stream_id, grpc_status::INTERNAL).await;
        }
    }
}

fn gateway_request_wire(target: &str, peer_ip: &str) -> Vec<u8> {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };
    let mut request = Request {
        method: "GET".to_string(),
        path,
        query,
        version: Version::Http11,
        headers: Headers::new(),
        body: Vec::new(),
    };
    forward::normalize_upstream_request(&mut request, peer_ip, None);
    request.to_wire()
}

fn first_string(messages: &[Vec<u8>]) -> Vec<u8> {
    messages
        .first()
        .and_then(|m| pb::decode_string_field1(m))
        .unwrap_or_default()
}

async fn send_grpc_ok(frame_tx: &mpsc::Sender<Vec<u8>>, stream_id: u32, frames: Vec<Vec<u8>>) {
    send_grpc_frames(frame_tx, stream_id, frames, grpc_status::OK).await;
}

async fn send_grpc_frames(
    frame_tx: &mpsc::Sender<Vec<u8>>,
    stream_id: u32,
    messages: Vec<Vec<u8>>,
    status: &str,
) {
    let mut out = encode_headers(
        stream_id,
        200,
        &[Header::new("content-type", "application/grpc")],
        false,
    );
    for message in messages {
        out.extend_from_slice(&encode_data(stream_id, &message, false));
    }
    out.extend_from_slice(&encode_trailers(
        stream_id,
        &[Header::new("grpc-status", status)],
    ));
    let _ = frame_tx.send(out).await;
}

async fn send_grpc_error(frame_tx: &mpsc::Sender<Vec<u8>>, stream_id: u32, status: &str) {
    let mut out = encode_headers(
        stream_id,
        200,
        &[Header::new("content-type", "application/grpc")],
        false,
    );
    out.extend_from_slice(&encode_trailers(
        stream_id,
        &[Header::new("grpc-status", status)],
    ));
    let _ = frame_tx.send(out).await;
}

// ============================================================================
// Conversion helpers
// ============================================================================

/// Build the HTTP/1.1 upstream request for a non-gRPC stream. `None`
/// when the request cannot be represented (unparseable body coding).
fn to_upstream_wire(ctx: &Arc<ProxyContext>, request: &H2Request, peer_ip: &str) -> Option<Vec<u8>> {
    let (path, query) = match request.path.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (request.path.clone(), String::new()),
    };

    let mut headers = Headers::with_capacity(request.headers.len());
    for h in &request.headers {
        headers.append(h.name.clone(), h.value.clone());
    }

    let mut http1 = Request {
        method: request.method.clone(),
        path: path.clone(),
        query,
        version: Version::Http11,
        headers,
        body: request.body.clone(),
    };

    // Request body arrives possibly compressed; upstream gets identity.
    if let Some(encoding) = http1
        .headers
        .get("content-encoding")
        .and_then(Encoding::parse)
    {
        if !encoding.is_identity() {
            match trellis_compression::decompress(encoding, &http1.body) {
                Ok(body) => {
                    http1.body = body;
                    http1.headers.remove("content-encoding");
                }
                Err(_) => return None,
            }
        }
    }

    if let Some(rule_idx) = ctx.rewrite.match_rule(&http1.method, &path) {
        ctx.rewrite.apply_request(rule_idx, &mut http1);
    }

    let authority = (!request.authority.is_empty()).then_some(request.authority.as_str());
    forward::normalize_upstream_request(&mut http1, peer_ip, authority);
    Some(http1.to_wire())
}

fn h2_header_or_query(
    request: &H2Request,
    query: &str,
    header: &str,
    query_name: &str,
) -> Option<String> {
    request
        .header(header)
        .map(str::to_string)
        .or_else(|| {
            query.split('&').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k == query_name).then(|| v.to_string())
            })
        })
        .filter(|v| !v.is_empty())
}

fn h2_affinity_key(ctx: &Arc<ProxyContext>, request: &H2Request, peer_ip: &str) -> String {
    let derived = match ctx.cfg.affinity_mode {
        AffinityMode::Ip => Some(peer_ip.to_string()),
        AffinityMode::Header => request.header(&ctx.cfg.affinity_header).map(str::to_string),
        AffinityMode::Cookie => request
            .header("cookie")
            .and_then(|c| trellis_proto::cookie::get_cookie_value(c, &ctx.cfg.affinity_cookie))
            .map(str::to_string),
    };
    derived
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| peer_ip.to_string())
}

fn h2_task_meta(
    ctx: &Arc<ProxyContext>,
    request: &H2Request,
    query: &str,
    peer_ip: &str,
) -> TaskMeta {
    let cfg = &ctx.sched_cfg;
    let priority = request
        .header(&cfg.priority_header)
        .map(str::to_string)
        .or_else(|| query_value(query, &cfg.priority_query))
        .and_then(|v| v.parse::<u8>().ok())
        .map(|p| p.min(9))
        .unwrap_or(5);
    let flow = request
        .header(&cfg.flow_header)
        .map(str::to_string)
        .or_else(|| query_value(query, &cfg.flow_query))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer_ip.to_string());
    let deadline = request
        .header(&cfg.deadline_header)
        .map(str::to_string)
        .or_else(|| query_value(query, &cfg.deadline_query))
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_millis)
        .unwrap_or(cfg.default_deadline);
    TaskMeta {
        priority,
        flow,
        deadline,
    }
}

fn query_value(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Non-gRPC local error/status reply.
async fn send_plain(frame_tx: &mpsc::Sender<Vec<u8>>, stream_id: u32, status: u16, body: &[u8]) {
    let headers = vec![Header::new("content-type", "text/plain")];
    let frames = encode_response(stream_id, status, &headers, body);
    let _ = frame_tx.send(frames).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h2_request(path: &str, headers: &[(&str, &str)], body: &[u8]) -> H2Request {
        H2Request {
            stream_id: 1,
            method: "POST".into(),
            path: path.into(),
            scheme: "http".into(),
            authority: "t".into(),
            headers: headers
                .iter()
                .map(|(n, v)| Header::new(*n, *v))
                .collect(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_h2_header_or_query() {
        let req = h2_request("/x", &[("x-model", "llama")], b"");
        assert_eq!(
            h2_header_or_query(&req, "", "x-model", "model"),
            Some("llama".into())
        );
        let req = h2_request("/x", &[], b"");
        assert_eq!(
            h2_header_or_query(&req, "model=phi&a=b", "x-model", "model"),
            Some("phi".into())
        );
        assert_eq!(h2_header_or_query(&req, "", "x-model", "model"), None);
    }

    #[test]
    fn test_gateway_request_wire() {
        let wire = gateway_request_wire("/api/x?n=1", "7.7.7.7");
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("GET /api/x?n=1 HTTP/1.1\r\n"));
        assert!(text.contains("X-Forwarded-For: 7.7.7.7\r\n"));
        assert!(text.contains("Accept-Encoding: identity\r\n"));
    }

    #[test]
    fn test_first_string() {
        let msg = pb::encode_string_field1(b"hello");
        assert_eq!(first_string(&[msg]), b"hello");
        assert!(first_string(&[]).is_empty());
    }
}
