//! Application protocol sniffing on the first bytes of a connection.
//!
//! HTTP/2 prior-knowledge clients open with `PRI * HTTP/2.0\r\n\r\n`,
//! which no HTTP/1 request line can start with (methods are token
//! characters followed by a space, and `PRI ` + `* ` is not a valid
//! HTTP/1 target for any real client). Four bytes settle it.

use trellis_proto::h2::PREFACE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Decide from the data read so far. `None` means not enough bytes yet.
pub fn detect(buf: &[u8]) -> Option<Protocol> {
    let marker = &PREFACE[..4]; // "PRI "
    if buf.len() < marker.len() {
        return if marker.starts_with(buf) { None } else { Some(Protocol::Http1) };
    }
    if &buf[..4] == marker {
        Some(Protocol::Http2)
    } else {
        Some(Protocol::Http1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http2_preface() {
        assert_eq!(detect(PREFACE), Some(Protocol::Http2));
        assert_eq!(detect(b"PRI * HTTP/2.0"), Some(Protocol::Http2));
    }

    #[test]
    fn test_http1_requests() {
        assert_eq!(detect(b"GET / HTTP/1.1\r\n"), Some(Protocol::Http1));
        assert_eq!(detect(b"POST /x HTTP/1.1\r\n"), Some(Protocol::Http1));
        assert_eq!(detect(b"PUT"), Some(Protocol::Http1));
    }

    #[test]
    fn test_needs_more_bytes() {
        assert_eq!(detect(b""), None);
        assert_eq!(detect(b"P"), None);
        assert_eq!(detect(b"PR"), None);
        assert_eq!(detect(b"PRI"), None);
        // "PA" diverges from the preface immediately.
        assert_eq!(detect(b"PA"), Some(Protocol::Http1));
    }
}
