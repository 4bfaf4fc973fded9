//! Stored value codec: `status\ncontent-type\nbody`.
//!
//! The body may be arbitrary bytes; only the first two newline-delimited
//! fields are text.

/// A cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let head = format!("{}\n{}\n", self.status, self.content_type);
        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let first_nl = bytes.iter().position(|&b| b == b'\n')?;
        let rest = &bytes[first_nl + 1..];
        let second_nl = rest.iter().position(|&b| b == b'\n')?;

        let status: u16 = std::str::from_utf8(&bytes[..first_nl]).ok()?.parse().ok()?;
        let content_type = std::str::from_utf8(&rest[..second_nl]).ok()?.to_string();
        Some(Self {
            status,
            content_type,
            body: rest[second_nl + 1..].to_vec(),
        })
    }
}
