//! HTTP/1.1 parsing and serialization.
//!
//! The request parser is incremental and reusable: feed it a `BytesMut`
//! that accumulates socket reads and it consumes exactly the bytes that
//! belong to the current message, leaving pipelined followers in place.
//! Head parsing is delegated to `httparse`; body framing (chunked,
//! content-length, close-delimited) is a local state machine shared with
//! the response side.
//!
//! Any error is terminal for the connection: requests map to
//! `400 Bad Request`, upstream responses to `502 Bad Gateway`.

use bytes::{Buf, BytesMut};

use crate::error::ParseError;
use crate::headers::Headers;

/// Cap on the head section (request/status line + headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Cap on one chunk-size line including extensions.
const MAX_CHUNK_LINE: usize = 8 * 1024;
/// Cap on the trailer section after the last chunk.
const MAX_TRAILER_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

// ============================================================================
// Version and status helpers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Canonical reason phrase for the statuses the proxy emits itself.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

// ============================================================================
// Request
// ============================================================================

/// One parsed HTTP/1.1 request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Query string without the leading `?`; empty if absent.
    pub query: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// `path?query` as it appears on the request line.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Close policy: HTTP/1.0 closes unless `Connection: Keep-Alive`,
    /// HTTP/1.1 keeps alive unless `Connection: close`.
    pub fn keeps_alive(&self) -> bool {
        match self.version {
            Version::Http10 => self.headers.contains_token("connection", "keep-alive"),
            Version::Http11 => !self.headers.contains_token("connection", "close"),
        }
    }

    /// Value of a query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then_some(v)
        })
    }

    /// Serialize for the upstream wire. The caller has already fixed up
    /// framing headers (Content-Length et al.).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

// ============================================================================
// Body framing
// ============================================================================

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
    /// Body runs until the peer closes (responses only).
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataCrlf,
    Trailers,
}

/// Incremental body scanner/decoder.
///
/// `advance` consumes raw wire bytes and optionally writes the decoded
/// payload (chunk framing stripped) into `out`; pass `None` to track
/// message boundaries without copying, which is what pass-through
/// forwarding does.
#[derive(Debug)]
pub struct BodyReader {
    kind: BodyKind,
    remaining: u64,
    phase: ChunkPhase,
    trailer_seen: usize,
    done: bool,
}

impl BodyReader {
    pub fn new(kind: BodyKind) -> Self {
        let done = matches!(kind, BodyKind::None) || kind == BodyKind::Length(0);
        Self {
            remaining: match kind {
                BodyKind::Length(n) => n,
                _ => 0,
            },
            kind,
            phase: ChunkPhase::Size,
            trailer_seen: 0,
            done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Scan `data`, returning how many bytes belong to this body.
    pub fn advance(
        &mut self,
        data: &[u8],
        mut out: Option<&mut Vec<u8>>,
    ) -> Result<usize, ParseError> {
        if self.done {
            return Ok(0);
        }
        match self.kind {
            BodyKind::None => Ok(0),
            BodyKind::Length(_) => {
                let take = (self.remaining.min(data.len() as u64)) as usize;
                if let Some(out) = out.as_deref_mut() {
                    out.extend_from_slice(&data[..take]);
                }
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(take)
            }
            BodyKind::Eof => {
                if let Some(out) = out.as_deref_mut() {
                    out.extend_from_slice(data);
                }
                Ok(data.len())
            }
            BodyKind::Chunked => self.advance_chunked(data, out),
        }
    }

    fn advance_chunked(
        &mut self,
        data: &[u8],
        mut out: Option<&mut Vec<u8>>,
    ) -> Result<usize, ParseError> {
        let mut pos = 0;
        while pos < data.len() && !self.done {
            match self.phase {
                ChunkPhase::Size => {
                    let rest = &data[pos..];
                    let nl = match memchr::memchr(b'\n', rest) {
                        Some(i) => i,
                        None => {
                            if rest.len() > MAX_CHUNK_LINE {
                                return Err(ParseError::BadChunk);
                            }
                            return Ok(pos);
                        }
                    };
                    let line = &rest[..nl];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    let size = parse_chunk_size(line)?;
                    pos += nl + 1;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailers;
                        self.trailer_seen = 0;
                    } else {
                        self.remaining = size;
                        self.phase = ChunkPhase::Data;
                    }
                }
                ChunkPhase::Data => {
                    let avail = data.len() - pos;
                    let take = (self.remaining.min(avail as u64)) as usize;
                    if let Some(out) = out.as_deref_mut() {
                        out.extend_from_slice(&data[pos..pos + take]);
                    }
                    pos += take;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.phase = ChunkPhase::DataCrlf;
                    }
                }
                ChunkPhase::DataCrlf => {
                    // Exactly CRLF terminates chunk data.
                    let rest = &data[pos..];
                    if rest.len() < 2 {
                        return Ok(pos);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ParseError::BadChunk);
                    }
                    pos += 2;
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    let rest = &data[pos..];
                    let nl = match memchr::memchr(b'\n', rest) {
                        Some(i) => i,
                        None => {
                            self.trailer_seen += rest.len();
                            if self.trailer_seen > MAX_TRAILER_BYTES {
                                return Err(ParseError::BadChunk);
                            }
                            return Ok(data.len());
                        }
                    };
                    let line = &rest[..nl];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    pos += nl + 1;
                    if line.is_empty() {
                        self.done = true;
                    } else {
                        self.trailer_seen += nl + 1;
                        if self.trailer_seen > MAX_TRAILER_BYTES {
                            return Err(ParseError::BadChunk);
                        }
                    }
                }
            }
        }
        Ok(pos)
    }

    /// The peer closed. Close-delimited bodies complete; anything else
    /// still unfinished was truncated.
    pub fn finish_on_eof(&mut self) -> Result<(), ParseError> {
        if self.done {
            return Ok(());
        }
        match self.kind {
            BodyKind::Eof => {
                self.done = true;
                Ok(())
            }
            BodyKind::None => {
                self.done = true;
                Ok(())
            }
            _ => Err(ParseError::UnexpectedEof),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    // Extensions after ';' are ignored.
    let digits = match memchr::memchr(b';', line) {
        Some(i) => &line[..i],
        None => line,
    };
    let digits = trim_ascii(digits);
    if digits.is_empty() || digits.len() > 16 {
        return Err(ParseError::BadChunk);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::BadChunk),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(d)))
            .ok_or(ParseError::BadChunk)?;
    }
    Ok(size)
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

// ============================================================================
// Request parser
// ============================================================================

#[derive(Debug)]
enum ReqState {
    Head,
    Body { request: Request, reader: BodyReader },
}

/// Incremental, reusable request parser (one in flight at a time; reset
/// happens automatically when a request completes).
#[derive(Debug)]
pub struct RequestParser {
    state: ReqState,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ReqState::Head,
        }
    }

    /// Consume as much of `buf` as belongs to the current request.
    /// Returns `Some(request)` when complete, `None` when more bytes are
    /// needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ParseError> {
        loop {
            match &mut self.state {
                ReqState::Head => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut req = httparse::Request::new(&mut headers);
                    let status = req.parse(buf).map_err(|_| ParseError::BadRequestLine)?;
                    let head_len = match status {
                        httparse::Status::Partial => {
                            if buf.len() > MAX_HEAD_BYTES {
                                return Err(ParseError::HeadTooLarge(MAX_HEAD_BYTES));
                            }
                            return Ok(None);
                        }
                        httparse::Status::Complete(n) => n,
                    };

                    let request = build_request(&req)?;
                    let kind = request_body_kind(&request.headers)?;
                    buf.advance(head_len);
                    self.state = ReqState::Body {
                        request,
                        reader: BodyReader::new(kind),
                    };
                }
                ReqState::Body { request, reader } => {
                    if !reader.is_done() {
                        let consumed = reader.advance(buf, Some(&mut request.body))?;
                        buf.advance(consumed);
                        if !reader.is_done() {
                            return Ok(None);
                        }
                    }
                    let done = std::mem::take(request);
                    self.state = ReqState::Head;
                    return Ok(Some(done));
                }
            }
        }
    }
}

fn build_request(req: &httparse::Request<'_, '_>) -> Result<Request, ParseError> {
    let method = req.method.ok_or(ParseError::BadRequestLine)?;
    let target = req.path.ok_or(ParseError::BadRequestLine)?;
    let version = match req.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err(ParseError::BadRequestLine),
    };
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ParseError::BadRequestLine);
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = Headers::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let value = std::str::from_utf8(h.value).map_err(|_| ParseError::BadHeader)?;
        headers.append(h.name, value.trim());
    }

    Ok(Request {
        method: method.to_string(),
        path,
        query,
        version,
        headers,
        body: Vec::new(),
    })
}

fn request_body_kind(headers: &Headers) -> Result<BodyKind, ParseError> {
    if headers.contains_token("transfer-encoding", "chunked") {
        return Ok(BodyKind::Chunked);
    }
    if let Some(cl) = headers.get("content-length") {
        let n: u64 = cl.trim().parse().map_err(|_| ParseError::BadContentLength)?;
        return Ok(BodyKind::Length(n));
    }
    Ok(BodyKind::None)
}

// ============================================================================
// Response parsing
// ============================================================================

/// Parsed status line + headers of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Keep-alive verdict for the upstream connection.
    pub fn keeps_alive(&self) -> bool {
        match self.version {
            Version::Http10 => self.headers.contains_token("connection", "keep-alive"),
            Version::Http11 => !self.headers.contains_token("connection", "close"),
        }
    }

    /// Serialize the head (status line + headers + blank line).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Try to parse a response head from the front of `buf`.
/// Returns the head and its wire length when complete.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let status = resp.parse(buf).map_err(|_| ParseError::BadStatusLine)?;
    let head_len = match status {
        httparse::Status::Partial => {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(ParseError::HeadTooLarge(MAX_HEAD_BYTES));
            }
            return Ok(None);
        }
        httparse::Status::Complete(n) => n,
    };

    let version = match resp.version {
        Some(0) => Version::Http10,
        _ => Version::Http11,
    };
    let code = resp.code.ok_or(ParseError::BadStatusLine)?;
    let mut hdrs = Headers::with_capacity(resp.headers.len());
    for h in resp.headers.iter() {
        let value = std::str::from_utf8(h.value).map_err(|_| ParseError::BadHeader)?;
        hdrs.append(h.name, value.trim());
    }

    Ok(Some((
        ResponseHead {
            version,
            status: code,
            reason: resp.reason.unwrap_or("").to_string(),
            headers: hdrs,
        },
        head_len,
    )))
}

/// Body framing for a response to `method`.
pub fn response_body_kind(head: &ResponseHead, is_head_request: bool) -> Result<BodyKind, ParseError> {
    if is_head_request
        || head.status / 100 == 1
        || head.status == 204
        || head.status == 304
    {
        return Ok(BodyKind::None);
    }
    if head.headers.contains_token("transfer-encoding", "chunked") {
        return Ok(BodyKind::Chunked);
    }
    if let Some(cl) = head.headers.get("content-length") {
        let n: u64 = cl.trim().parse().map_err(|_| ParseError::BadContentLength)?;
        return Ok(BodyKind::Length(n));
    }
    Ok(BodyKind::Eof)
}

/// A complete response, for callers that buffer the whole wire exchange
/// (health probes, batching, tests).
#[derive(Debug, Clone)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

/// Parse one response out of a fully-received buffer; `eof` marks whether
/// the peer has closed (finishing close-delimited bodies). Returns the
/// response and total bytes consumed.
pub fn parse_response(
    buf: &[u8],
    is_head_request: bool,
    eof: bool,
) -> Result<Option<(Response, usize)>, ParseError> {
    let (head, head_len) = match parse_response_head(buf)? {
        Some(x) => x,
        None => return Ok(None),
    };
    let kind = response_body_kind(&head, is_head_request)?;
    let mut reader = BodyReader::new(kind);
    let mut body = Vec::new();
    let consumed = reader.advance(&buf[head_len..], Some(&mut body))?;
    if !reader.is_done() {
        if !eof {
            return Ok(None);
        }
        reader.finish_on_eof()?;
    }
    Ok(Some((Response { head, body }, head_len + consumed)))
}

// ============================================================================
// Response building
// ============================================================================

/// Build a minimal local response (errors, admin replies).
pub fn simple_response(status: u16, content_type: &str, body: &[u8], close: bool) -> Vec<u8> {
    let mut head = ResponseHead {
        version: Version::Http11,
        status,
        reason: status_reason(status).to_string(),
        headers: Headers::new(),
    };
    if !body.is_empty() || status != 204 {
        head.headers.set("Content-Type", content_type);
        head.headers.set("Content-Length", body.len().to_string());
    }
    head.headers
        .set("Connection", if close { "close" } else { "keep-alive" });
    let mut out = head.to_wire();
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(wire: &str) -> Vec<Request> {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(wire.as_bytes());
        let mut out = Vec::new();
        while let Some(req) = parser.parse(&mut buf).unwrap() {
            out.push(req);
            if buf.is_empty() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_get_no_body() {
        let reqs = parse_all("GET /a?x=1 HTTP/1.1\r\nHost: t\r\n\r\n");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, "GET");
        assert_eq!(reqs[0].path, "/a");
        assert_eq!(reqs[0].query, "x=1");
        assert_eq!(reqs[0].target(), "/a?x=1");
        assert_eq!(reqs[0].headers.get("host"), Some("t"));
        assert!(reqs[0].keeps_alive());
    }

    #[test]
    fn test_content_length_body() {
        let reqs = parse_all("POST /p HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(reqs[0].body, b"hello");
    }

    #[test]
    fn test_chunked_body_with_extensions_and_trailers() {
        let wire = "POST /p HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5;ext=1\r\nhello\r\n3\r\n, w\r\n0\r\nX-Trail: v\r\n\r\n";
        let reqs = parse_all(wire);
        assert_eq!(reqs[0].body, b"hello, w");
    }

    #[test]
    fn test_pipelined_requests() {
        let wire = "POST /e HTTP/1.1\r\nHost: t\r\nContent-Length: 2\r\n\r\nhi\
                    GET /ok HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n";
        let reqs = parse_all(wire);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].path, "/e");
        assert_eq!(reqs[1].path, "/ok");
        assert!(!reqs[1].keeps_alive());
    }

    #[test]
    fn test_incremental_feed() {
        let wire = "GET / HTTP/1.1\r\nHost: t\r\n\r\n";
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::new();
        for (i, b) in wire.bytes().enumerate() {
            buf.extend_from_slice(&[b]);
            let res = parser.parse(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(res.is_none());
            } else {
                assert!(res.is_some());
            }
        }
    }

    #[test]
    fn test_bad_chunk_size() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(
            &b"POST /p HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"[..],
        );
        assert_eq!(parser.parse(&mut buf), Err(ParseError::BadChunk));
    }

    #[test]
    fn test_bad_content_length() {
        let mut parser = RequestParser::new();
        let mut buf =
            BytesMut::from(&b"POST /p HTTP/1.1\r\nHost: t\r\nContent-Length: -4\r\n\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(ParseError::BadContentLength));
    }

    #[test]
    fn test_http10_close_policy() {
        let reqs = parse_all("GET / HTTP/1.0\r\nHost: t\r\n\r\n");
        assert!(!reqs[0].keeps_alive());
        let reqs = parse_all("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(reqs[0].keeps_alive());
    }

    #[test]
    fn test_response_head_and_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nContent-Type: text/plain\r\n\r\nabc";
        let (resp, used) = parse_response(wire, false, false).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(resp.head.status, 200);
        assert_eq!(resp.body, b"abc");
        assert!(resp.head.keeps_alive());
    }

    #[test]
    fn test_response_eof_delimited() {
        let wire = b"HTTP/1.0 200 OK\r\n\r\npartial";
        assert!(parse_response(wire, false, false).unwrap().is_none());
        let (resp, _) = parse_response(wire, false, true).unwrap().unwrap();
        assert_eq!(resp.body, b"partial");
        assert!(!resp.head.keeps_alive());
    }

    #[test]
    fn test_response_204_has_no_body() {
        let wire = b"HTTP/1.1 204 No Content\r\n\r\n";
        let (resp, used) = parse_response(wire, false, false).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_head_request_has_no_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let (resp, _) = parse_response(wire, true, false).unwrap().unwrap();
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_body_reader_tracks_without_copy() {
        let mut reader = BodyReader::new(BodyKind::Chunked);
        let wire = b"3\r\nabc\r\n0\r\n\r\nNEXT";
        let consumed = reader.advance(wire, None).unwrap();
        assert!(reader.is_done());
        assert_eq!(&wire[consumed..], b"NEXT");
    }

    #[test]
    fn test_truncated_length_body_on_eof() {
        let mut reader = BodyReader::new(BodyKind::Length(10));
        reader.advance(b"abc", None).unwrap();
        assert_eq!(reader.finish_on_eof(), Err(ParseError::UnexpectedEof));
    }

    #[test]
    fn test_simple_response_wire() {
        let wire = simple_response(429, "text/plain", b"slow down", true);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("slow down"));
    }

    #[test]
    fn test_request_to_wire_round_trip() {
        let mut req = Request {
            method: "POST".into(),
            path: "/x".into(),
            query: "a=b".into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: b"data".to_vec(),
        };
        req.headers.set("Host", "up");
        req.headers.set("Content-Length", "4");
        let wire = req.to_wire();
        let again = parse_all(std::str::from_utf8(&wire).unwrap());
        assert_eq!(again[0].method, "POST");
        assert_eq!(again[0].target(), "/x?a=b");
        assert_eq!(again[0].body, b"data");
    }
}
