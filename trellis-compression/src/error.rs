// Error type for the content-coding layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("gzip error: {0}")]
    Gzip(std::io::Error),

    #[error("deflate error: {0}")]
    Deflate(std::io::Error),

    #[error("unknown content coding: {0}")]
    UnknownCoding(String),
}
