//! Trellis: a multi-protocol reverse proxy and load balancer.
//!
//! HTTP/1.1, HTTP/2 (h2c prior knowledge), gRPC, WebSocket and raw
//! L4 TCP/UDP forwarding with health-, load- and model-affinity-aware
//! backend selection, admission control and response transformation.
//!
//! This crate is the facade: it re-exports the member crates under one
//! namespace and carries the `trellis-proxy` binary.
//!
//! ```rust,no_run
//! use trellis::config::Settings;
//! use trellis::core::ProxyServer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_file("trellis.ini")?;
//! ProxyServer::from_settings(settings, None)?.run().await?;
//! # Ok(())
//! # }
//! ```

pub use trellis_balance as balance;
pub use trellis_cache as cache;
pub use trellis_compression as compression;
pub use trellis_config as config;
pub use trellis_core as core;
pub use trellis_log as log;
pub use trellis_proto as proto;
pub use trellis_ratelimit as ratelimit;

pub use trellis_core::{ProxyError, ProxyServer};
