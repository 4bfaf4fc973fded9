//! Upstream connections: the per-backend idle pool and leases.

pub mod pool;

pub use pool::{ConnectionPool, Lease, PoolConfig};
