//! HTTP/2 h2c server-side connection state machine (RFC 7540 subset).
//!
//! Scope matches what the proxy terminates: prior-knowledge cleartext
//! connections, SETTINGS/PING handling, request assembly from
//! HEADERS + CONTINUATION + DATA with padding and priority prefixes
//! stripped. RST_STREAM and WINDOW_UPDATE are parsed and dropped; flow
//! control windows are not tracked, receivers are assumed to tolerate the
//! default 65535-byte window (see the design notes).
//!
//! The machine is sans-io: `on_data` consumes raw TCP bytes, appends any
//! control frames it owes the peer (SETTINGS, ACKs) to `out`, and pushes
//! fully-assembled requests into `requests`. The caller owns the socket.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use crate::error::H2Error;
use crate::hpack::{self, Header, HpackDecoder};

/// The 24-byte client connection preface.
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame types the machine recognizes.
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// Frame flag bits.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;

/// Outbound DATA/HEADERS payloads are chunked to the default max frame
/// size so we never need to negotiate a larger one.
pub const MAX_SEND_FRAME: usize = 16_384;

/// Inbound frames larger than this kill the connection.
const MAX_RECV_FRAME: u32 = 1 << 20;

/// Cap on an assembled request (header block + body) per stream.
const MAX_STREAM_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// Frame header
// ============================================================================

/// The 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub ty: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(b: &[u8]) -> Self {
        Self {
            length: u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]),
            ty: b[3],
            flags: b[4],
            stream_id: u32::from_be_bytes([b[5], b[6], b[7], b[8]]) & 0x7fff_ffff,
        }
    }
}

/// Append one frame (header + payload) to `out`.
pub fn write_frame(out: &mut Vec<u8>, ty: u8, frame_flags: u8, stream_id: u32, payload: &[u8]) {
    let len = payload.len() as u32;
    out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8, ty, frame_flags]);
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(payload);
}

// ============================================================================
// Requests
// ============================================================================

/// One complete request assembled from a stream.
#[derive(Debug, Clone)]
pub struct H2Request {
    pub stream_id: u32,
    pub method: String,
    /// Includes the query string, as `:path` does.
    pub path: String,
    pub scheme: String,
    pub authority: String,
    /// Regular (non-pseudo) headers in wire order.
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl H2Request {
    /// First value for a regular header, case-insensitive (h2 names are
    /// already lowercase on the wire).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Default)]
struct StreamState {
    header_block: Vec<u8>,
    end_headers: bool,
    end_stream: bool,
    headers: Vec<Header>,
    method: String,
    path: String,
    scheme: String,
    authority: String,
    body: Vec<u8>,
}

// ============================================================================
// Connection state machine
// ============================================================================

#[derive(Debug)]
pub struct Http2Connection {
    preface_done: bool,
    buf: BytesMut,
    decoder: HpackDecoder,
    streams: HashMap<u32, StreamState>,
    /// Stream currently mid header-block (CONTINUATION must target it).
    continuation_on: Option<u32>,
}

impl Default for Http2Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Http2Connection {
    pub fn new() -> Self {
        Self {
            preface_done: false,
            buf: BytesMut::with_capacity(4096),
            decoder: HpackDecoder::new(),
            streams: HashMap::new(),
            continuation_on: None,
        }
    }

    /// Feed raw socket bytes. Control frames owed to the peer land in
    /// `out`; completed requests land in `requests`.
    pub fn on_data(
        &mut self,
        data: &[u8],
        out: &mut Vec<u8>,
        requests: &mut Vec<H2Request>,
    ) -> Result<(), H2Error> {
        self.buf.extend_from_slice(data);

        if !self.preface_done {
            if self.buf.len() < PREFACE.len() {
                return Ok(());
            }
            if &self.buf[..PREFACE.len()] != PREFACE.as_slice() {
                return Err(H2Error::BadPreface);
            }
            self.buf.advance(PREFACE.len());
            self.preface_done = true;
            // Our side of the handshake: an empty SETTINGS frame.
            write_frame(out, frame_type::SETTINGS, 0, 0, &[]);
        }

        while self.buf.len() >= 9 {
            let header = FrameHeader::parse(&self.buf[..9]);
            if header.length > MAX_RECV_FRAME {
                return Err(H2Error::FrameTooLarge(header.length));
            }
            let total = 9 + header.length as usize;
            if self.buf.len() < total {
                break;
            }
            let payload = self.buf[9..total].to_vec();
            self.buf.advance(total);
            self.handle_frame(header, &payload, out, requests)?;
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        out: &mut Vec<u8>,
        requests: &mut Vec<H2Request>,
    ) -> Result<(), H2Error> {
        // A header block in progress admits only CONTINUATION on the same
        // stream.
        if let Some(sid) = self.continuation_on {
            if header.ty != frame_type::CONTINUATION || header.stream_id != sid {
                return Err(H2Error::BadFrame);
            }
        }

        match header.ty {
            frame_type::SETTINGS => self.handle_settings(header, payload, out),
            frame_type::PING => {
                if header.stream_id != 0 || payload.len() != 8 {
                    return Err(H2Error::BadFrame);
                }
                if header.flags & flags::ACK == 0 {
                    write_frame(out, frame_type::PING, flags::ACK, 0, payload);
                }
                Ok(())
            }
            frame_type::HEADERS => self.handle_headers(header, payload, requests),
            frame_type::CONTINUATION => self.handle_continuation(header, payload, requests),
            frame_type::DATA => self.handle_data(header, payload, requests),
            // PRIORITY, RST_STREAM, GOAWAY, WINDOW_UPDATE and unknown
            // types are accepted and dropped.
            _ => Ok(()),
        }
    }

    fn handle_settings(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), H2Error> {
        if header.stream_id != 0 {
            return Err(H2Error::BadFrame);
        }
        if header.flags & flags::ACK != 0 {
            if !payload.is_empty() {
                return Err(H2Error::BadFrame);
            }
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(H2Error::BadFrame);
        }
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            if id == SETTINGS_HEADER_TABLE_SIZE {
                self.decoder.set_settings_max(value as usize);
            }
        }
        write_frame(out, frame_type::SETTINGS, flags::ACK, 0, &[]);
        Ok(())
    }

    fn handle_headers(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        requests: &mut Vec<H2Request>,
    ) -> Result<(), H2Error> {
        if header.stream_id == 0 {
            return Err(H2Error::BadFrame);
        }
        let fragment = strip_padding_and_priority(header.flags, payload)?;

        let stream = self.streams.entry(header.stream_id).or_default();
        if stream.header_block.len() + fragment.len() > MAX_STREAM_BYTES {
            return Err(H2Error::BadFrame);
        }
        stream.header_block.extend_from_slice(fragment);
        if header.flags & flags::END_STREAM != 0 {
            stream.end_stream = true;
        }

        if header.flags & flags::END_HEADERS != 0 {
            self.finish_header_block(header.stream_id)?;
            self.try_emit(header.stream_id, requests)?;
        } else {
            self.continuation_on = Some(header.stream_id);
        }
        Ok(())
    }

    fn handle_continuation(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        requests: &mut Vec<H2Request>,
    ) -> Result<(), H2Error> {
        if self.continuation_on != Some(header.stream_id) {
            return Err(H2Error::BadFrame);
        }
        let stream = self
            .streams
            .get_mut(&header.stream_id)
            .ok_or(H2Error::BadFrame)?;
        if stream.header_block.len() + payload.len() > MAX_STREAM_BYTES {
            return Err(H2Error::BadFrame);
        }
        stream.header_block.extend_from_slice(payload);

        if header.flags & flags::END_HEADERS != 0 {
            self.continuation_on = None;
            self.finish_header_block(header.stream_id)?;
            self.try_emit(header.stream_id, requests)?;
        }
        Ok(())
    }

    fn handle_data(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        requests: &mut Vec<H2Request>,
    ) -> Result<(), H2Error> {
        if header.stream_id == 0 {
            return Err(H2Error::BadFrame);
        }
        let data = strip_padding(header.flags, payload)?;
        let stream = match self.streams.get_mut(&header.stream_id) {
            Some(s) => s,
            // DATA for a stream we already emitted or never opened.
            None => return Ok(()),
        };
        if stream.body.len() + data.len() > MAX_STREAM_BYTES {
            return Err(H2Error::BadFrame);
        }
        stream.body.extend_from_slice(data);
        if header.flags & flags::END_STREAM != 0 {
            stream.end_stream = true;
            self.try_emit(header.stream_id, requests)?;
        }
        Ok(())
    }

    /// Decode the accumulated header block and pull out pseudo-headers.
    fn finish_header_block(&mut self, stream_id: u32) -> Result<(), H2Error> {
        let stream = self.streams.get_mut(&stream_id).ok_or(H2Error::BadFrame)?;
        let block = std::mem::take(&mut stream.header_block);
        let decoded = self.decoder.decode(&block)?;
        let stream = self.streams.get_mut(&stream_id).ok_or(H2Error::BadFrame)?;
        for h in decoded {
            if !h.name.starts_with(':') {
                stream.headers.push(h);
                continue;
            }
            match h.name.as_str() {
                ":method" => stream.method = h.value,
                ":path" => stream.path = h.value,
                ":scheme" => stream.scheme = h.value,
                ":authority" => stream.authority = h.value,
                _ => {}
            }
        }
        stream.end_headers = true;
        Ok(())
    }

    /// A stream becomes a request only once both END_HEADERS and
    /// END_STREAM have arrived; the stream is deleted on emit.
    fn try_emit(&mut self, stream_id: u32, requests: &mut Vec<H2Request>) -> Result<(), H2Error> {
        let ready = self
            .streams
            .get(&stream_id)
            .map(|s| s.end_headers && s.end_stream)
            .unwrap_or(false);
        if !ready {
            return Ok(());
        }
        let stream = self.streams.remove(&stream_id).ok_or(H2Error::BadFrame)?;
        if stream.method.is_empty() {
            return Err(H2Error::MissingPseudoHeader(":method"));
        }
        if stream.path.is_empty() {
            return Err(H2Error::MissingPseudoHeader(":path"));
        }
        requests.push(H2Request {
            stream_id,
            method: stream.method,
            path: stream.path,
            scheme: stream.scheme,
            authority: stream.authority,
            headers: stream.headers,
            body: stream.body,
        });
        Ok(())
    }
}

fn strip_padding(frame_flags: u8, payload: &[u8]) -> Result<&[u8], H2Error> {
    if frame_flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    let pad = *payload.first().ok_or(H2Error::BadFrame)? as usize;
    let body = &payload[1..];
    if pad > body.len() {
        return Err(H2Error::BadFrame);
    }
    Ok(&body[..body.len() - pad])
}

fn strip_padding_and_priority(frame_flags: u8, payload: &[u8]) -> Result<&[u8], H2Error> {
    let unpadded = strip_padding(frame_flags, payload)?;
    if frame_flags & flags::PRIORITY == 0 {
        return Ok(unpadded);
    }
    // Exclusive bit + 31-bit dependency + 8-bit weight.
    if unpadded.len() < 5 {
        return Err(H2Error::BadFrame);
    }
    Ok(&unpadded[5..])
}

// ============================================================================
// Response encoding
// ============================================================================

/// HEADERS (with `:status` first) followed by chunked DATA, END_STREAM on
/// the last frame. `content-length` is appended automatically.
pub fn encode_response(stream_id: u32, status: u16, headers: &[Header], body: &[u8]) -> Vec<u8> {
    let mut all = Vec::with_capacity(headers.len() + 2);
    all.push(Header::new(":status", status.to_string()));
    all.push(Header::new("content-length", body.len().to_string()));
    all.extend_from_slice(headers);
    let mut out = encode_header_frames(stream_id, &all, body.is_empty());
    if !body.is_empty() {
        encode_data_into(&mut out, stream_id, body, true);
    }
    out
}

/// HEADERS only, for streaming responses (gRPC).
pub fn encode_headers(stream_id: u32, status: u16, headers: &[Header], end_stream: bool) -> Vec<u8> {
    let mut all = Vec::with_capacity(headers.len() + 1);
    all.push(Header::new(":status", status.to_string()));
    all.extend_from_slice(headers);
    encode_header_frames(stream_id, &all, end_stream)
}

/// DATA frames, chunked to the default max frame size.
pub fn encode_data(stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 32);
    encode_data_into(&mut out, stream_id, data, end_stream);
    out
}

/// Trailing headers with END_STREAM (gRPC status trailers).
pub fn encode_trailers(stream_id: u32, headers: &[Header]) -> Vec<u8> {
    encode_header_frames(stream_id, headers, true)
}

fn encode_header_frames(stream_id: u32, headers: &[Header], end_stream: bool) -> Vec<u8> {
    let block = hpack::encode_no_index(headers);
    let mut out = Vec::with_capacity(block.len() + 32);
    let stream_flag = if end_stream { flags::END_STREAM } else { 0 };

    if block.len() <= MAX_SEND_FRAME {
        write_frame(
            &mut out,
            frame_type::HEADERS,
            flags::END_HEADERS | stream_flag,
            stream_id,
            &block,
        );
        return out;
    }

    // Oversized header block: HEADERS without END_HEADERS, then
    // CONTINUATION frames, END_HEADERS on the last.
    let mut chunks = block.chunks(MAX_SEND_FRAME).peekable();
    let first = chunks.next().unwrap_or(&[]);
    write_frame(&mut out, frame_type::HEADERS, stream_flag, stream_id, first);
    while let Some(chunk) = chunks.next() {
        let fin = if chunks.peek().is_none() {
            flags::END_HEADERS
        } else {
            0
        };
        write_frame(&mut out, frame_type::CONTINUATION, fin, stream_id, chunk);
    }
    out
}

fn encode_data_into(out: &mut Vec<u8>, stream_id: u32, data: &[u8], end_stream: bool) {
    if data.is_empty() {
        write_frame(
            out,
            frame_type::DATA,
            if end_stream { flags::END_STREAM } else { 0 },
            stream_id,
            &[],
        );
        return;
    }
    let mut chunks = data.chunks(MAX_SEND_FRAME).peekable();
    while let Some(chunk) = chunks.next() {
        let fin = if end_stream && chunks.peek().is_none() {
            flags::END_STREAM
        } else {
            0
        };
        write_frame(out, frame_type::DATA, fin, stream_id, chunk);
    }
}
