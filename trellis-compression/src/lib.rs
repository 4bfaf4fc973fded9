//! Trellis Content Codings
//!
//! gzip and deflate request/response bodies plus `Accept-Encoding`
//! negotiation. The proxy normalizes upstream traffic to identity and
//! re-encodes toward the client, so both directions go through here.

mod algorithm;
mod error;

pub use algorithm::{compress, decompress, negotiate, Encoding};
pub use error::CompressionError;
