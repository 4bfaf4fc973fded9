//! Listening sockets, accept gating and client streams.

pub mod listener;
pub mod sniff;
pub mod stream;
pub mod tls;

pub use listener::{AcceptDecision, AcceptGate, AcceptGateConfig, ConnPermit};
pub use sniff::Protocol;
pub use stream::ClientStream;
