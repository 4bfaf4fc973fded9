//! Content coding implementations and negotiation.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error::CompressionError;

/// Content codings the proxy produces and consumes.
///
/// `deflate` is the zlib-wrapped stream per RFC 7230's reading of the
/// coding, which is also what every mainstream server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    /// Parse a single coding token.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Encoding::Identity),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            _ => None,
        }
    }

    /// Wire name for `Content-Encoding`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Encoding::Identity)
    }
}

/// Pick the coding to answer with for a client `Accept-Encoding` value.
/// gzip wins over deflate; anything unrecognized or absent yields
/// identity. A coding listed with `q=0` is treated as refused.
pub fn negotiate(accept_encoding: Option<&str>) -> Encoding {
    let header = match accept_encoding {
        Some(h) => h,
        None => return Encoding::Identity,
    };
    let mut gzip = false;
    let mut deflate = false;
    for part in header.split(',') {
        let mut attrs = part.split(';');
        let token = attrs.next().unwrap_or("").trim().to_ascii_lowercase();
        let refused = attrs.any(|a| {
            let a = a.trim();
            a.strip_prefix("q=")
                .map(|q| q.trim().parse::<f64>().map(|v| v == 0.0).unwrap_or(false))
                .unwrap_or(false)
        });
        if refused {
            continue;
        }
        match token.as_str() {
            "gzip" | "x-gzip" | "*" => gzip = true,
            "deflate" => deflate = true,
            _ => {}
        }
    }
    if gzip {
        Encoding::Gzip
    } else if deflate {
        Encoding::Deflate
    } else {
        Encoding::Identity
    }
}

/// Encode `data` with `encoding`. Identity returns the input unchanged.
pub fn compress(encoding: Encoding, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data).map_err(CompressionError::Gzip)?;
            enc.finish().map_err(CompressionError::Gzip)
        }
        Encoding::Deflate => {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data).map_err(CompressionError::Deflate)?;
            enc.finish().map_err(CompressionError::Deflate)
        }
    }
}

/// Decode `data` from `encoding` back to identity.
pub fn decompress(encoding: Encoding, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(CompressionError::Gzip)?;
            Ok(out)
        }
        Encoding::Deflate => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(CompressionError::Deflate)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_noop() {
        let data = b"HELLO".to_vec();
        assert_eq!(compress(Encoding::Identity, &data).unwrap(), data);
        assert_eq!(decompress(Encoding::Identity, &data).unwrap(), data);
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"HELLO HELLO HELLO HELLO".repeat(100);
        let packed = compress(Encoding::Gzip, &data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(Encoding::Gzip, &packed).unwrap(), data);
    }

    #[test]
    fn test_deflate_round_trip() {
        let data = b"the quick brown fox".to_vec();
        let packed = compress(Encoding::Deflate, &data).unwrap();
        assert_eq!(decompress(Encoding::Deflate, &packed).unwrap(), data);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert!(decompress(Encoding::Gzip, b"not gzip at all").is_err());
        assert!(decompress(Encoding::Deflate, b"nope").is_err());
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(None), Encoding::Identity);
        assert_eq!(negotiate(Some("gzip")), Encoding::Gzip);
        assert_eq!(negotiate(Some("deflate, gzip;q=0.8")), Encoding::Gzip);
        assert_eq!(negotiate(Some("deflate")), Encoding::Deflate);
        assert_eq!(negotiate(Some("br")), Encoding::Identity);
        assert_eq!(negotiate(Some("gzip;q=0, deflate")), Encoding::Deflate);
        assert_eq!(negotiate(Some("*")), Encoding::Gzip);
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(Encoding::parse("GZIP"), Some(Encoding::Gzip));
        assert_eq!(Encoding::parse(" deflate "), Some(Encoding::Deflate));
        assert_eq!(Encoding::parse(""), Some(Encoding::Identity));
        assert_eq!(Encoding::parse("br"), None);
    }

    #[test]
    fn test_empty_body_round_trip() {
        for enc in [Encoding::Gzip, Encoding::Deflate] {
            let packed = compress(enc, b"").unwrap();
            assert_eq!(decompress(enc, &packed).unwrap(), b"");
        }
    }
}
