// Error taxonomy of the serving core.
//
// Each variant maps to a specific reply and cleanup policy in the session
// engine; none of them take the process down.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Client sent something unparseable: reply 400, close.
    #[error("client parse error: {0}")]
    ClientParse(#[from] trellis_proto::ParseError),

    /// HTTP/2 framing or HPACK failure: connection is torn down.
    #[error("http/2 protocol error: {0}")]
    H2(#[from] trellis_proto::H2Error),

    /// Rate/connection limit or ACL denial; carries the reply status
    /// (429 or 403).
    #[error("admission denied with status {status}")]
    AdmissionDenied { status: u16 },

    /// No eligible backend: reply 503.
    #[error("no eligible backend")]
    NoBackend,

    /// Could not obtain an upstream connection: reply 502.
    #[error("backend connect failed: {0}")]
    BackendConnect(std::io::Error),

    /// Upstream answered garbage or hung up before headers: reply 502
    /// and trip passive fail-over.
    #[error("backend protocol failure: {0}")]
    BackendProtocol(String),

    /// Transform buffer cap exceeded; non-fatal, the caller falls back
    /// to pass-through.
    #[error("transform buffer exceeded {0} bytes")]
    TransformOverflow(usize),

    /// TLS handshake failed; connection closed silently.
    #[error("tls failure: {0}")]
    Tls(std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status for errors that get a local reply.
    pub fn reply_status(&self) -> Option<u16> {
        match self {
            ProxyError::ClientParse(_) => Some(400),
            ProxyError::AdmissionDenied { status } => Some(*status),
            ProxyError::NoBackend => Some(503),
            ProxyError::BackendConnect(_) | ProxyError::BackendProtocol(_) => Some(502),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_status_mapping() {
        assert_eq!(
            ProxyError::ClientParse(trellis_proto::ParseError::BadRequestLine).reply_status(),
            Some(400)
        );
        assert_eq!(
            ProxyError::AdmissionDenied { status: 429 }.reply_status(),
            Some(429)
        );
        assert_eq!(ProxyError::NoBackend.reply_status(), Some(503));
        assert_eq!(
            ProxyError::BackendProtocol("eof".into()).reply_status(),
            Some(502)
        );
        assert_eq!(
            ProxyError::TransformOverflow(1024).reply_status(),
            None
        );
    }
}
