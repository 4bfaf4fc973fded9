//! End-to-end exercises against real sockets: a test backend behind a
//! fully-assembled proxy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use trellis_config::Settings;
use trellis_core::server::{ProxyServer, RunningProxy};
use trellis_proto::h2::{self, frame_type, flags, FrameHeader};
use trellis_proto::hpack::{self, Header, HpackDecoder};
use trellis_proto::http1::{simple_response, RequestParser};
use trellis_proto::{grpc, pb};

const WAIT: Duration = Duration::from_secs(5);

/// A keep-alive-capable HTTP/1.1 echo backend.
///
/// - `POST /echo` answers `echo:<body>`
/// - `GET /ok` answers `ok`
/// - `GET /a` / `GET /b` answer `A` / `B`
/// - `GET /plain` answers `HELLO`
/// - `GET /ws` with an upgrade answers `101` and then echoes raw bytes
async fn spawn_backend() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut parser = RequestParser::new();
                let mut buf = BytesMut::new();
                loop {
                    let request = loop {
                        match parser.parse(&mut buf) {
                            Ok(Some(req)) => break Some(req),
                            Ok(None) => {
                                match sock.read_buf(&mut buf).await {
                                    Ok(0) | Err(_) => break None,
                                    Ok(_) => {}
                                }
                            }
                            Err(_) => break None,
                        }
                    };
                    let Some(request) = request else { return };
                    counter.fetch_add(1, Ordering::SeqCst);

                    if request.path == "/ws" && request.headers.contains("sec-websocket-key") {
                        let _ = sock
                            .write_all(
                                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                            )
                            .await;
                        // Raw echo from here on.
                        let mut raw = [0u8; 1024];
                        loop {
                            match sock.read(&mut raw).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => {
                                    if sock.write_all(&raw[..n]).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }

                    let body: Vec<u8> = match (request.method.as_str(), request.path.as_str()) {
                        ("POST", "/echo") => {
                            let mut b = b"echo:".to_vec();
                            b.extend_from_slice(&request.body);
                            b
                        }
                        ("GET", "/ok") => b"ok".to_vec(),
                        ("GET", "/a") => b"A".to_vec(),
                        ("GET", "/b") => b"B".to_vec(),
                        ("GET", "/plain") => b"HELLO".to_vec(),
                        _ => b"fallthrough".to_vec(),
                    };
                    let reply = simple_response(200, "text/plain", &body, false);
                    if sock.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (port, hits)
}

async fn start_proxy(extra: &str, backend_port: u16) -> RunningProxy {
    let ini = format!(
        "[global]\nlisten_port = 0\nthreads = 2\n[health_check]\nmode = off\n\
         [backends]\nb1 = 127.0.0.1:{backend_port}\n{extra}"
    );
    let settings = Settings::parse(&ini).unwrap();
    ProxyServer::from_settings(settings, None)
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn connect(proxy: &RunningProxy) -> TcpStream {
    TcpStream::connect(("127.0.0.1", proxy.l7_addr.port()))
        .await
        .unwrap()
}

async fn read_until_close(sock: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = timeout(WAIT, sock.read_to_end(&mut out)).await;
    out
}

// ============================================================================
// S1: pipelined keep-alive ordering
// ============================================================================

#[tokio::test]
async fn pipelined_keep_alive_responses_in_order() {
    let (backend_port, hits) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    let mut sock = connect(&proxy).await;
    let wire = "POST /echo HTTP/1.1\r\nHost:t\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\n\
                5\r\nhello\r\n0\r\n\r\n\
                GET /ok HTTP/1.1\r\nHost:t\r\nConnection: close\r\n\r\n";
    sock.write_all(wire.as_bytes()).await.unwrap();

    let all = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
    let first_at = all.find("echo:hello").expect("first response body");
    let second_at = all.find("ok").expect("second response body");
    assert!(first_at < second_at, "responses out of order: {all}");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    proxy.abort();
}

// ============================================================================
// S2: HTTP/2 multiplexing
// ============================================================================

fn h2_get(stream_id: u32, path: &str) -> Vec<u8> {
    let headers = vec![
        Header::new(":method", "GET"),
        Header::new(":path", path),
        Header::new(":scheme", "http"),
        Header::new(":authority", "t"),
    ];
    let block = hpack::encode_no_index(&headers);
    let mut out = Vec::new();
    h2::write_frame(
        &mut out,
        frame_type::HEADERS,
        flags::END_HEADERS | flags::END_STREAM,
        stream_id,
        &block,
    );
    out
}

/// Collected per-stream response state from raw frames.
#[derive(Default)]
struct StreamReply {
    status: Option<String>,
    body: Vec<u8>,
    trailers: Vec<(String, String)>,
    done: bool,
}

fn parse_frames(
    buf: &mut Vec<u8>,
    decoder: &mut HpackDecoder,
    replies: &mut std::collections::HashMap<u32, StreamReply>,
) {
    loop {
        if buf.len() < 9 {
            return;
        }
        let header = FrameHeader::parse(&buf[..9]);
        let total = 9 + header.length as usize;
        if buf.len() < total {
            return;
        }
        let payload = buf[9..total].to_vec();
        buf.drain(..total);

        match header.ty {
            frame_type::HEADERS => {
                let decoded = decoder.decode(&payload).unwrap();
                let entry = replies.entry(header.stream_id).or_default();
                for h in decoded {
                    if h.name == ":status" {
                        entry.status = Some(h.value);
                    } else if entry.status.is_some() && entry.done {
                        entry.trailers.push((h.name, h.value));
                    } else if entry.status.is_some() && header.flags & flags::END_STREAM != 0 {
                        entry.trailers.push((h.name, h.value));
                    }
                }
                if header.flags & flags::END_STREAM != 0 {
                    entry.done = true;
                }
            }
            frame_type::DATA => {
                let entry = replies.entry(header.stream_id).or_default();
                entry.body.extend_from_slice(&payload);
                if header.flags & flags::END_STREAM != 0 {
                    entry.done = true;
                }
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn http2_multiplexed_streams() {
    let (backend_port, hits) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    let mut sock = connect(&proxy).await;
    let mut wire = h2::PREFACE.to_vec();
    h2::write_frame(&mut wire, frame_type::SETTINGS, 0, 0, &[]);
    wire.extend_from_slice(&h2_get(1, "/a"));
    wire.extend_from_slice(&h2_get(3, "/b"));
    sock.write_all(&wire).await.unwrap();

    let mut decoder = HpackDecoder::new();
    let mut replies = std::collections::HashMap::new();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + WAIT;
    while replies.len() < 2
        || !replies.values().all(|r: &StreamReply| r.done)
    {
        let n = tokio::time::timeout_at(deadline, sock.read(&mut chunk))
            .await
            .expect("timed out waiting for h2 responses")
            .unwrap();
        assert!(n > 0, "proxy closed early");
        buf.extend_from_slice(&chunk[..n]);
        parse_frames(&mut buf, &mut decoder, &mut replies);
    }

    let a = &replies[&1];
    let b = &replies[&3];
    assert_eq!(a.status.as_deref(), Some("200"));
    assert_eq!(b.status.as_deref(), Some("200"));
    assert_eq!(a.body, b"A");
    assert_eq!(b.body, b"B");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    proxy.abort();
}

// ============================================================================
// S3: compression conversion
// ============================================================================

#[tokio::test]
async fn gzip_conversion_toward_client() {
    let (backend_port, _) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    let mut sock = connect(&proxy).await;
    sock.write_all(
        b"GET /plain HTTP/1.1\r\nHost:t\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let raw = read_until_close(&mut sock).await;
    let (response, _) = trellis_proto::http1::parse_response(&raw, false, true)
        .unwrap()
        .expect("complete response");
    assert_eq!(response.head.status, 200);
    assert_eq!(response.head.headers.get("content-encoding"), Some("gzip"));
    let decoded = trellis_compression::decompress(
        trellis_compression::Encoding::Gzip,
        &response.body,
    )
    .unwrap();
    assert_eq!(decoded, b"HELLO");
    proxy.abort();
}

// ============================================================================
// S4: access control + token
// ============================================================================

#[tokio::test]
async fn acl_token_gate() {
    let (backend_port, _) = spawn_backend().await;
    let extra = "[access_control]\nip_mode = deny\ncidrs = 10.0.0.0/8\n\
                 require_token = 1\ntoken_header = X-Api-Token\nvalid_tokens = t2\n";
    let proxy = start_proxy(extra, backend_port).await;

    // Valid token from loopback.
    let mut sock = connect(&proxy).await;
    sock.write_all(
        b"GET /x HTTP/1.1\r\nHost:t\r\nX-Api-Token: t2\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let ok = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
    assert!(ok.starts_with("HTTP/1.1 200"), "expected 200, got: {ok}");

    // Missing token.
    let mut sock = connect(&proxy).await;
    sock.write_all(b"GET /x HTTP/1.1\r\nHost:t\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let denied = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
    assert!(denied.starts_with("HTTP/1.1 403"), "expected 403, got: {denied}");
    proxy.abort();
}

// ============================================================================
// No eligible backend -> 503
// ============================================================================

#[tokio::test]
async fn no_backend_yields_503() {
    let settings = Settings::parse("[global]\nlisten_port = 0\n[health_check]\nmode = off\n").unwrap();
    let proxy = ProxyServer::from_settings(settings, None)
        .unwrap()
        .start()
        .await
        .unwrap();

    let mut sock = connect(&proxy).await;
    sock.write_all(b"GET / HTTP/1.1\r\nHost:t\r\n\r\n").await.unwrap();
    let reply = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
    assert!(reply.starts_with("HTTP/1.1 503"), "got: {reply}");
    proxy.abort();
}

// ============================================================================
// Malformed request -> 400 then close
// ============================================================================

#[tokio::test]
async fn bad_request_gets_400() {
    let (backend_port, _) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    let mut sock = connect(&proxy).await;
    sock.write_all(b"POST /x HTTP/1.1\r\nHost:t\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
        .await
        .unwrap();
    let reply = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
    assert!(reply.starts_with("HTTP/1.1 400"), "got: {reply}");
    proxy.abort();
}

// ============================================================================
// Admin surface
// ============================================================================

#[tokio::test]
async fn admin_stats_and_backend_lifecycle() {
    let (backend_port, _) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    // /stats
    let mut sock = connect(&proxy).await;
    sock.write_all(b"GET /stats HTTP/1.1\r\nHost:t\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = read_until_close(&mut sock).await;
    let (response, _) = trellis_proto::http1::parse_response(&raw, false, true)
        .unwrap()
        .unwrap();
    assert_eq!(response.head.status, 200);
    let stats: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(stats["backends"].as_array().unwrap().len(), 1);

    // register + remove
    let body = format!(r#"{{"ip":"127.0.0.1","port":{},"weight":2}}"#, backend_port + 1);
    let mut sock = connect(&proxy).await;
    let req = format!(
        "POST /admin/backend_register HTTP/1.1\r\nHost:t\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    sock.write_all(req.as_bytes()).await.unwrap();
    let reply = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
    assert!(reply.starts_with("HTTP/1.1 200"), "got: {reply}");
    assert_eq!(proxy.ctx.manager.len(), 2);

    let body = format!(r#"{{"backend":"127.0.0.1:{}"}}"#, backend_port + 1);
    let mut sock = connect(&proxy).await;
    let req = format!(
        "POST /admin/backend_remove HTTP/1.1\r\nHost:t\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    sock.write_all(req.as_bytes()).await.unwrap();
    let _ = read_until_close(&mut sock).await;
    assert_eq!(proxy.ctx.manager.len(), 1);
    proxy.abort();
}

// ============================================================================
// WebSocket upgrade -> tunnel
// ============================================================================

#[tokio::test]
async fn websocket_upgrade_becomes_tunnel() {
    let (backend_port, _) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    let mut sock = connect(&proxy).await;
    sock.write_all(
        b"GET /ws HTTP/1.1\r\nHost:t\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGVzdA==\r\n\r\n",
    )
    .await
    .unwrap();

    // 101 from the backend passes through verbatim.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + WAIT;
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tokio::time::timeout_at(deadline, sock.read(&mut chunk))
            .await
            .expect("timeout waiting for 101")
            .unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    }
    assert!(buf.starts_with(b"HTTP/1.1 101"));

    // The connection is now a byte pipe.
    sock.write_all(b"frame-1").await.unwrap();
    let mut echo = [0u8; 7];
    timeout(WAIT, sock.read_exact(&mut echo)).await.unwrap().unwrap();
    assert_eq!(&echo, b"frame-1");
    proxy.abort();
}

// ============================================================================
// gRPC echo built-in
// ============================================================================

#[tokio::test]
async fn grpc_echo_unary() {
    let (backend_port, _) = spawn_backend().await;
    let proxy = start_proxy("", backend_port).await;

    let mut sock = connect(&proxy).await;
    let mut wire = h2::PREFACE.to_vec();
    h2::write_frame(&mut wire, frame_type::SETTINGS, 0, 0, &[]);

    let headers = vec![
        Header::new(":method", "POST"),
        Header::new(":path", "/proxy.Echo/Unary"),
        Header::new(":scheme", "http"),
        Header::new(":authority", "t"),
        Header::new("content-type", "application/grpc"),
    ];
    let block = hpack::encode_no_index(&headers);
    h2::write_frame(&mut wire, frame_type::HEADERS, flags::END_HEADERS, 1, &block);
    let message = grpc::encode_message(&pb::encode_string_field1(b"ping"));
    h2::write_frame(&mut wire, frame_type::DATA, flags::END_STREAM, 1, &message);
    sock.write_all(&wire).await.unwrap();

    let mut decoder = HpackDecoder::new();
    let mut replies = std::collections::HashMap::new();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + WAIT;
    while !replies.get(&1).map(|r: &StreamReply| r.done).unwrap_or(false) {
        let n = tokio::time::timeout_at(deadline, sock.read(&mut chunk))
            .await
            .expect("timed out waiting for grpc reply")
            .unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
        parse_frames(&mut buf, &mut decoder, &mut replies);
    }

    let reply = &replies[&1];
    assert_eq!(reply.status.as_deref(), Some("200"));
    let messages = grpc::decode_messages(&reply.body).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(pb::decode_string_field1(&messages[0]).unwrap(), b"ping");
    assert!(reply
        .trailers
        .iter()
        .any(|(n, v)| n == "grpc-status" && v == "0"));
    proxy.abort();
}

// ============================================================================
// Passive fail-over visible through the proxy
// ============================================================================

#[tokio::test]
async fn dead_backend_trips_passive_failover() {
    let (backend_port, _) = spawn_backend().await;
    // Register a dead backend too; after it fails once, traffic must
    // stick to the live one.
    let ini = format!(
        "[global]\nlisten_port = 0\nthreads = 2\n[health_check]\nmode = off\n\
         [backends]\nb1 = 127.0.0.1:{backend_port}\nb2 = 127.0.0.1:1\n"
    );
    let settings = Settings::parse(&ini).unwrap();
    let proxy = ProxyServer::from_settings(settings, None)
        .unwrap()
        .start()
        .await
        .unwrap();

    let mut statuses = Vec::new();
    for _ in 0..6 {
        let mut sock = connect(&proxy).await;
        sock.write_all(b"GET /ok HTTP/1.1\r\nHost:t\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let reply = String::from_utf8_lossy(&read_until_close(&mut sock).await).into_owned();
        statuses.push(reply[..12.min(reply.len())].to_string());
    }
    // At most one 502 (the strike that trips passive fail-over); the
    // rest are 200s from the live backend.
    let bad = statuses.iter().filter(|s| s.contains("502")).count();
    assert!(bad <= 1, "statuses: {statuses:?}");
    assert!(statuses.iter().any(|s| s.contains("200")));
    proxy.abort();
}
