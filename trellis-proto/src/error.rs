// Error types shared by the protocol engines.

use thiserror::Error;

/// HTTP/1.1 parse failures. All are terminal for the connection: the
/// caller answers `400 Bad Request` (requests) or `502 Bad Gateway`
/// (upstream responses) and closes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("malformed status line")]
    BadStatusLine,

    #[error("malformed header")]
    BadHeader,

    #[error("header section exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("invalid chunk size")]
    BadChunk,

    #[error("invalid content-length")]
    BadContentLength,

    #[error("body truncated by peer")]
    UnexpectedEof,
}

/// HTTP/2 connection-fatal failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum H2Error {
    #[error("bad connection preface")]
    BadPreface,

    #[error("malformed frame")]
    BadFrame,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),

    #[error("hpack decode error")]
    Hpack,

    #[error("missing required pseudo-header {0}")]
    MissingPseudoHeader(&'static str),
}

/// gRPC message framing failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GrpcError {
    #[error("compressed gRPC messages are not supported")]
    CompressedFlag,

    #[error("truncated gRPC frame")]
    Truncated,

    #[error("gRPC message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),
}
