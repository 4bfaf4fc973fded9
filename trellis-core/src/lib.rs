//! Trellis Serving Core
//!
//! Everything between the listening sockets and the upstream origins:
//!
//! - [`net`]: listener setup, accept gating, protocol sniffing (TLS /
//!   HTTP/2 preface / HTTP/1) and the unified client stream
//! - [`session`]: the L7 engine - admission, routing, forwarding,
//!   response transformation, WebSocket takeover, batching, gRPC
//!   built-ins and the admin surface
//! - [`upstream`]: the backend connection pool and leases
//! - [`sched`]: priority / fair / EDF dispatchers bounding in-flight
//!   upstream work
//! - [`udp`]: the datagram proxy
//! - [`stats`], [`history`], [`audit`]: observability
//! - [`server`]: assembly from a [`trellis_config::Settings`]
//!
//! The concurrency model is one task per client connection; a connection
//! and its session state never leave that task. Shared services
//! (backend manager, limiters, pool) are internally synchronized and
//! injected as `Arc` handles.

pub mod access;
pub mod audit;
pub mod error;
pub mod history;
pub mod net;
pub mod plugin;
pub mod rewrite;
pub mod sched;
pub mod server;
pub mod session;
pub mod stats;
pub mod udp;
pub mod upstream;

pub use error::ProxyError;
pub use server::ProxyServer;
pub use stats::Metrics;
