//! Plugin contract.
//!
//! Dynamic loading lives outside the core; this is the interface a
//! loader registers implementations against. A plugin sees every
//! request after admission and may answer it outright, in which case
//! the response goes to the client as-is and the connection closes.

use async_trait::async_trait;

use trellis_proto::http1::Request;

/// A locally-produced plugin response.
#[derive(Debug, Clone)]
pub struct PluginResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// One request-handling extension.
#[async_trait]
pub trait RequestPlugin: Send + Sync {
    /// Plugin name for diagnostics.
    fn name(&self) -> &str;

    /// Return `Some` to answer the request locally, `None` to let it
    /// continue down the proxy path.
    async fn handle(&self, request: &Request, peer_ip: &str) -> Option<PluginResponse>;
}
