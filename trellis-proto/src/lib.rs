//! Trellis Wire Protocols
//!
//! The protocol engines the proxy is built on, as pure byte-in/byte-out
//! state machines with no I/O of their own:
//!
//! - [`http1`]: HTTP/1.1 request/response parsing (chunked, content-length
//!   and close-delimited bodies), serialization and keep-alive policy
//! - [`hpack`]: RFC 7541 header compression (static + dynamic table,
//!   Huffman decoding)
//! - [`h2`]: RFC 7540 subset - frame codec and the h2c connection state
//!   machine used on the client side of the proxy
//! - [`grpc`]: gRPC 5-byte message framing
//! - [`pb`]: protobuf varints and the string-typed field #1 used by the
//!   gateway services
//! - [`cookie`]: Cookie header value extraction
//!
//! Header storage everywhere is an ordered list of name/value pairs:
//! lookups are case-insensitive first-occurrence, and forwarding preserves
//! repeated list-valued headers (Set-Cookie, Via) verbatim.

pub mod cookie;
pub mod error;
pub mod grpc;
pub mod h2;
pub mod headers;
pub mod hpack;
pub mod http1;
pub mod pb;

mod huffman;

pub use error::{GrpcError, H2Error, ParseError};
pub use headers::Headers;
