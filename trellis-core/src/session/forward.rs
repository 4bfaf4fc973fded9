//! The upstream exchange.
//!
//! Two shapes:
//!
//! - [`forward_streaming`]: HTTP/1 client path. Pass-through mode copies
//!   bytes to the client as they arrive; transform mode buffers the
//!   response (bounded) to rewrite, re-encode or cache it, and falls
//!   back to pass-through when the buffer cap is hit.
//! - [`fetch_buffered`]: fully-buffered exchange for HTTP/2 conversion,
//!   batching and the gRPC gateway.
//!
//! Both record first-byte latency into the backend EWMA, trip passive
//! fail-over on protocol failures, and release the lease with a
//! keep-alive verdict only when the response parsed cleanly.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use trellis_balance::{BackendAddr, BackendManager};
use trellis_compression::{compress, decompress, Encoding};
use trellis_proto::http1::{
    parse_response_head, response_body_kind, BodyKind, BodyReader, Request, ResponseHead,
};
use trellis_proto::Headers;

use crate::error::ProxyError;
use crate::session::ProxyContext;

/// What (if anything) must happen to the response before the client
/// sees it.
#[derive(Debug, Clone, Default)]
pub struct TransformSpec {
    pub rule_idx: Option<usize>,
    /// Coding the client negotiated; re-encode when it differs from the
    /// upstream body.
    pub client_encoding: Encoding,
    pub cache_key: Option<String>,
    /// Whether the eventual client reply should say keep-alive.
    pub client_keep_alive: bool,
}

impl TransformSpec {
    /// True when this spec actually asks for anything.
    pub fn is_active(&self, ctx: &ProxyContext) -> bool {
        self.cache_key.is_some()
            || !self.client_encoding.is_identity()
            || self
                .rule_idx
                .map(|idx| ctx.rewrite.rule_mutates_response(idx))
                .unwrap_or(false)
    }
}

/// Result of a completed (or partially completed) exchange.
#[derive(Debug, Clone, Copy)]
pub struct ForwardOutcome {
    pub status: u16,
    /// The upstream exchange finished cleanly.
    pub success: bool,
    /// The client connection can no longer be used for further requests.
    pub client_close: bool,
}

/// Decrements the backend's active connection count on every exit path.
struct ConnTrack {
    manager: Arc<BackendManager>,
    id: String,
}

impl ConnTrack {
    fn new(manager: &Arc<BackendManager>, id: &str) -> Self {
        manager.on_conn_start(id);
        Self {
            manager: Arc::clone(manager),
            id: id.to_string(),
        }
    }
}

impl Drop for ConnTrack {
    fn drop(&mut self) {
        self.manager.on_conn_end(&self.id);
    }
}

/// Hop-by-hop and framing headers stripped before forwarding.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "content-encoding",
    "accept-encoding",
    "te",
    "upgrade",
];

/// Rewrite a parsed client request into the upstream form: hop-by-hop
/// stripped, identity coding requested, forwarding headers injected.
/// The body must already be identity bytes.
pub fn normalize_upstream_request(request: &mut Request, peer_ip: &str, authority: Option<&str>) {
    let host = request
        .headers
        .get("host")
        .map(str::to_string)
        .or_else(|| authority.map(str::to_string));
    let prior_xff = request.headers.get("x-forwarded-for").map(str::to_string);

    for name in HOP_BY_HOP {
        request.headers.remove(name);
    }

    if let Some(host) = host {
        request.headers.set("Host", host);
    }
    let xff = match prior_xff {
        Some(prior) => format!("{prior}, {peer_ip}"),
        None => peer_ip.to_string(),
    };
    request.headers.set("X-Forwarded-For", xff);
    request.headers.set("Connection", "Keep-Alive");
    request.headers.set("Accept-Encoding", "identity");
    if !request.body.is_empty() || matches!(request.method.as_str(), "POST" | "PUT" | "PATCH") {
        request
            .headers
            .set("Content-Length", request.body.len().to_string());
    }
}

/// State shared by both exchange shapes after the head arrives.
struct UpstreamResponse {
    lease: Option<crate::upstream::Lease>,
    backend_id: String,
    head: ResponseHead,
    head_wire: Vec<u8>,
    body_kind: BodyKind,
    reader: BodyReader,
    /// Unconsumed bytes after the head.
    buf: BytesMut,
    _track: ConnTrack,
}

impl UpstreamResponse {
    /// Hand the lease back with the keep-alive verdict; dropping an
    /// unreleased lease closes the socket, so both paths are safe.
    fn finish(&mut self, keep_alive: bool) {
        if let Some(lease) = self.lease.take() {
            lease.release(keep_alive);
        }
    }
}

/// Dial (or reuse), send the request, read the response head.
async fn open_exchange(
    ctx: &Arc<ProxyContext>,
    backend: &BackendAddr,
    wire: &[u8],
    is_head: bool,
) -> Result<UpstreamResponse, ProxyError> {
    let id = backend.id();
    let mut lease = ctx
        .pool
        .acquire(backend)
        .await
        .map_err(|e| {
            ctx.manager.report_failure(&id);
            ctx.metrics.inc_backend_failures();
            ProxyError::BackendConnect(e)
        })?;
    let track = ConnTrack::new(&ctx.manager, &id);

    let started = Instant::now();
    if let Err(e) = lease.stream.write_all(wire).await {
        ctx.manager.report_failure(&id);
        ctx.metrics.inc_backend_failures();
        return Err(ProxyError::BackendConnect(e));
    }

    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut first_byte_recorded = false;
    let (head, head_len) = loop {
        match parse_response_head(&buf) {
            Ok(Some(parsed)) => break parsed,
            Ok(None) => {}
            Err(err) => {
                ctx.manager.report_failure(&id);
                ctx.metrics.inc_backend_failures();
                return Err(ProxyError::BackendProtocol(err.to_string()));
            }
        }
        let n = timeout(ctx.cfg.upstream_wait, lease.stream.read_buf(&mut buf))
            .await
            .map_err(|_| {
                ctx.manager.report_failure(&id);
                ctx.metrics.inc_backend_failures();
                ProxyError::BackendProtocol("timeout waiting for response head".to_string())
            })?
            .map_err(|e| {
                ctx.manager.report_failure(&id);
                ctx.metrics.inc_backend_failures();
                ProxyError::BackendProtocol(e.to_string())
            })?;
        if n == 0 {
            ctx.manager.report_failure(&id);
            ctx.metrics.inc_backend_failures();
            return Err(ProxyError::BackendProtocol(
                "upstream closed before response headers".to_string(),
            ));
        }
        if !first_byte_recorded {
            first_byte_recorded = true;
            ctx.manager
                .record_response_ms(&id, started.elapsed().as_secs_f64() * 1000.0);
        }
    };

    let head_wire = buf[..head_len].to_vec();
    buf.advance(head_len);
    let body_kind = response_body_kind(&head, is_head)
        .map_err(|e| ProxyError::BackendProtocol(e.to_string()))?;
    trace!(backend = %id, status = head.status, ?body_kind, "upstream head received");

    Ok(UpstreamResponse {
        lease: Some(lease),
        backend_id: id,
        head,
        head_wire,
        body_kind,
        reader: BodyReader::new(body_kind),
        buf,
        _track: track,
    })
}

/// Pull one more chunk from upstream; Ok(false) = EOF.
async fn read_more(
    ctx: &Arc<ProxyContext>,
    up: &mut UpstreamResponse,
) -> Result<bool, ProxyError> {
    let stream = match up.lease.as_mut() {
        Some(lease) => &mut lease.stream,
        None => return Ok(false),
    };
    let n = timeout(ctx.cfg.upstream_wait, stream.read_buf(&mut up.buf))
        .await
        .map_err(|_| ProxyError::BackendProtocol("timeout reading response body".to_string()))?
        .map_err(|e| ProxyError::BackendProtocol(e.to_string()))?;
    Ok(n > 0)
}

fn release_verdict(up: &UpstreamResponse) -> bool {
    up.reader.is_done() && up.body_kind != BodyKind::Eof && up.head.keeps_alive()
}

// ============================================================================
// Streaming exchange (HTTP/1 clients)
// ============================================================================

/// Run the exchange against `backend`, writing the response to `client`.
pub async fn forward_streaming<W>(
    ctx: &Arc<ProxyContext>,
    backend: &BackendAddr,
    wire: &[u8],
    is_head: bool,
    spec: TransformSpec,
    client: &mut W,
) -> Result<ForwardOutcome, ProxyError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut up = open_exchange(ctx, backend, wire, is_head).await?;
    let status = up.head.status;

    let upstream_encoding = up
        .head
        .headers
        .get("content-encoding")
        .map(|v| Encoding::parse(v))
        .unwrap_or(Some(Encoding::Identity));
    // Transform requires a body we can present as identity bytes.
    let transform_active = spec.is_active(ctx) && upstream_encoding.is_some();

    if !transform_active {
        return stream_passthrough(ctx, &mut up, client, true).await;
    }

    // Buffer raw and decoded side by side so an overflow can still fall
    // back to byte-exact pass-through.
    let mut raw: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut decoded: Vec<u8> = Vec::with_capacity(8 * 1024);
    loop {
        if !up.buf.is_empty() {
            let consumed = up
                .reader
                .advance(&up.buf, Some(&mut decoded))
                .map_err(|e| ProxyError::BackendProtocol(e.to_string()))?;
            raw.extend_from_slice(&up.buf[..consumed]);
            up.buf.advance(consumed);
        }
        if raw.len() > ctx.cfg.transform_max_bytes || decoded.len() > ctx.cfg.transform_max_bytes {
            debug!(limit = ctx.cfg.transform_max_bytes, "transform buffer overflow, pass-through");
            return overflow_passthrough(ctx, &mut up, raw, client).await;
        }
        if up.reader.is_done() {
            break;
        }
        if !read_more(ctx, &mut up).await? {
            if up.reader.finish_on_eof().is_err() {
                ctx.manager.report_failure(&up.backend_id);
                ctx.metrics.inc_backend_failures();
                return Err(ProxyError::BackendProtocol("response body truncated".to_string()));
            }
            break;
        }
    }

    // Identity body in hand.
    let encoding = upstream_encoding.unwrap_or(Encoding::Identity);
    let identity_body = if encoding.is_identity() {
        decoded
    } else {
        decompress(encoding, &decoded)
            .map_err(|e| ProxyError::BackendProtocol(format!("upstream body decode: {e}")))?
    };

    let keep_alive_upstream = release_verdict(&up);
    up.finish(keep_alive_upstream);

    let reply = finalize_transformed(ctx, &spec, &up.head, identity_body).await;
    let written = client.write_all(&reply).await;
    let client_close = written.is_err() || !spec.client_keep_alive;
    if written.is_ok() {
        ctx.metrics.add_bytes_out(reply.len() as u64);
    }
    Ok(ForwardOutcome {
        status,
        success: true,
        client_close,
    })
}

/// Pass-through: head (optionally) + raw body bytes as they arrive.
async fn stream_passthrough<W>(
    ctx: &Arc<ProxyContext>,
    up: &mut UpstreamResponse,
    client: &mut W,
    send_head: bool,
) -> Result<ForwardOutcome, ProxyError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let status = up.head.status;
    if send_head {
        if client.write_all(&up.head_wire).await.is_err() {
            return Ok(ForwardOutcome {
                status,
                success: false,
                client_close: true,
            });
        }
        ctx.metrics.add_bytes_out(up.head_wire.len() as u64);
    }

    loop {
        if !up.buf.is_empty() {
            let consumed = up
                .reader
                .advance(&up.buf, None)
                .map_err(|e| ProxyError::BackendProtocol(e.to_string()))?;
            if consumed > 0 {
                if client.write_all(&up.buf[..consumed]).await.is_err() {
                    return Ok(ForwardOutcome {
                        status,
                        success: true,
                        client_close: true,
                    });
                }
                ctx.metrics.add_bytes_out(consumed as u64);
                up.buf.advance(consumed);
            }
        }
        if up.reader.is_done() {
            break;
        }
        if !read_more(ctx, up).await? {
            if up.reader.finish_on_eof().is_err() {
                // Truncated mid-body: the client cannot recover the
                // framing, hard-close it.
                return Ok(ForwardOutcome {
                    status,
                    success: false,
                    client_close: true,
                });
            }
            break;
        }
    }

    let keep_alive = release_verdict(up);
    let client_close = up.body_kind == BodyKind::Eof;
    up.finish(keep_alive);
    Ok(ForwardOutcome {
        status,
        success: true,
        client_close,
    })
}

/// Transform gave up: emit what was buffered, then keep streaming.
async fn overflow_passthrough<W>(
    ctx: &Arc<ProxyContext>,
    up: &mut UpstreamResponse,
    raw_so_far: Vec<u8>,
    client: &mut W,
) -> Result<ForwardOutcome, ProxyError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let status = up.head.status;
    let mut prefix = up.head_wire.clone();
    prefix.extend_from_slice(&raw_so_far);
    if client.write_all(&prefix).await.is_err() {
        return Ok(ForwardOutcome {
            status,
            success: false,
            client_close: true,
        });
    }
    ctx.metrics.add_bytes_out(prefix.len() as u64);
    stream_passthrough(ctx, up, client, false).await
}

/// Build the final client bytes for a fully-buffered transform.
async fn finalize_transformed(
    ctx: &Arc<ProxyContext>,
    spec: &TransformSpec,
    head: &ResponseHead,
    mut body: Vec<u8>,
) -> Vec<u8> {
    let mut headers: Headers = head
        .headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();

    if let Some(rule_idx) = spec.rule_idx {
        ctx.rewrite.apply_response(rule_idx, &mut headers, &mut body);
    }

    // Cache the identity form before client-facing encoding.
    if let (Some(cache), Some(key)) = (&ctx.cache, &spec.cache_key) {
        if head.status == 200 {
            let content_type = headers
                .get("content-type")
                .unwrap_or("application/octet-stream")
                .to_string();
            cache
                .store(key, &trellis_cache::StoredResponse::new(200, content_type, body.clone()))
                .await;
        }
    }

    let mut out_encoding = spec.client_encoding;
    let wire_body = if out_encoding.is_identity() {
        body
    } else {
        match compress(out_encoding, &body) {
            Ok(encoded) => encoded,
            Err(_) => {
                out_encoding = Encoding::Identity;
                body
            }
        }
    };

    headers.set("Content-Length", wire_body.len().to_string());
    if !out_encoding.is_identity() {
        headers.set("Content-Encoding", out_encoding.as_str());
    }
    headers.set(
        "Connection",
        if spec.client_keep_alive { "keep-alive" } else { "close" },
    );

    let out_head = ResponseHead {
        version: head.version,
        status: head.status,
        reason: head.reason.clone(),
        headers,
    };
    let mut out = out_head.to_wire();
    out.extend_from_slice(&wire_body);
    out
}

// ============================================================================
// Buffered exchange (HTTP/2, batching, gRPC gateway)
// ============================================================================

/// Full exchange returning the identity-decoded response.
pub async fn fetch_buffered(
    ctx: &Arc<ProxyContext>,
    backend: &BackendAddr,
    wire: &[u8],
    is_head: bool,
    max_bytes: usize,
) -> Result<(ResponseHead, Vec<u8>), ProxyError> {
    let mut up = open_exchange(ctx, backend, wire, is_head).await?;

    let mut decoded = Vec::with_capacity(8 * 1024);
    loop {
        if !up.buf.is_empty() {
            let consumed = up
                .reader
                .advance(&up.buf, Some(&mut decoded))
                .map_err(|e| ProxyError::BackendProtocol(e.to_string()))?;
            up.buf.advance(consumed);
        }
        if decoded.len() > max_bytes {
            return Err(ProxyError::TransformOverflow(max_bytes));
        }
        if up.reader.is_done() {
            break;
        }
        if !read_more(ctx, &mut up).await? {
            up.reader
                .finish_on_eof()
                .map_err(|e| ProxyError::BackendProtocol(e.to_string()))?;
            break;
        }
    }

    let keep_alive = release_verdict(&up);
    up.finish(keep_alive);

    let head = up.head;
    let encoding = head
        .headers
        .get("content-encoding")
        .and_then(Encoding::parse)
        .unwrap_or(Encoding::Identity);
    let body = if encoding.is_identity() {
        decoded
    } else {
        decompress(encoding, &decoded)
            .map_err(|e| ProxyError::BackendProtocol(format!("upstream body decode: {e}")))?
    };
    Ok((head, body))
}
