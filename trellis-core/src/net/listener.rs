//! Listener setup and accept-time gating.
//!
//! Binding goes through socket2 so SO_REUSEADDR (always) and SO_REUSEPORT
//! (opt-in) are set before `bind`. Accepted sockets pass the gate in the
//! order the admission design prescribes: global accept bucket, per-source
//! accept bucket, then total and per-IP connection caps. A denied socket
//! is dropped on the floor and counted.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::TcpListener;

use trellis_ratelimit::{ConnLimiter, ConnLimiterConfig, KeyedLimiter, KeyedLimiterConfig, TokenBucket};

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a TCP listener with the proxy's socket options.
pub fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Accept-time limits from `[ddos]` and `[connection_limit]`.
#[derive(Debug, Clone)]
pub struct AcceptGateConfig {
    pub accept_qps: f64,
    pub accept_burst: f64,
    pub per_ip_qps: f64,
    pub per_ip_burst: f64,
    pub per_ip_idle: Duration,
    pub per_ip_max_entries: usize,
    /// 0 = unlimited.
    pub max_total: usize,
    /// 0 = unlimited.
    pub max_per_ip: usize,
}

impl Default for AcceptGateConfig {
    fn default() -> Self {
        Self {
            accept_qps: 0.0,
            accept_burst: 0.0,
            per_ip_qps: 0.0,
            per_ip_burst: 0.0,
            per_ip_idle: Duration::from_secs(60),
            per_ip_max_entries: 10_000,
            max_total: 0,
            max_per_ip: 0,
        }
    }
}

/// Why a socket was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    AcceptRate,
    PerIpAcceptRate,
    TotalCap,
    PerIpCap,
}

/// The gate's verdict; `Admit` carries the RAII permit.
pub enum AcceptDecision {
    Admit(ConnPermit),
    Deny(DenyReason),
}

/// Holds the accepted connection's slots; dropping it releases them.
pub struct ConnPermit {
    gate: Arc<AcceptGate>,
    ip: String,
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        self.gate.active_total.fetch_sub(1, Ordering::Relaxed);
        self.gate.per_ip_conns.release(&self.ip);
    }
}

/// Shared accept gate for one listener family.
pub struct AcceptGate {
    accept_bucket: TokenBucket,
    per_ip_bucket: KeyedLimiter,
    per_ip_conns: ConnLimiter,
    max_total: usize,
    active_total: AtomicUsize,
    drops: AtomicUsize,
}

impl AcceptGate {
    pub fn new(cfg: AcceptGateConfig) -> Arc<Self> {
        Arc::new(Self {
            accept_bucket: TokenBucket::new(cfg.accept_qps, cfg.accept_burst),
            per_ip_bucket: KeyedLimiter::new(KeyedLimiterConfig {
                qps: cfg.per_ip_qps,
                burst: cfg.per_ip_burst,
                idle: cfg.per_ip_idle,
                max_entries: cfg.per_ip_max_entries,
                cleanup_every: 256,
            }),
            per_ip_conns: ConnLimiter::new(ConnLimiterConfig {
                max_per_key: cfg.max_per_ip,
                max_entries: cfg.per_ip_max_entries,
            }),
            max_total: cfg.max_total,
            active_total: AtomicUsize::new(0),
            drops: AtomicUsize::new(0),
        })
    }

    /// Evaluate one accepted socket.
    pub fn check(self: &Arc<Self>, peer_ip: &str) -> AcceptDecision {
        if !self.accept_bucket.allow(1.0) {
            return self.deny(DenyReason::AcceptRate);
        }
        if !self.per_ip_bucket.allow(peer_ip) {
            return self.deny(DenyReason::PerIpAcceptRate);
        }
        if self.max_total > 0 {
            // Optimistic claim; undone on the cap paths below.
            let prev = self.active_total.fetch_add(1, Ordering::Relaxed);
            if prev >= self.max_total {
                self.active_total.fetch_sub(1, Ordering::Relaxed);
                return self.deny(DenyReason::TotalCap);
            }
        } else {
            self.active_total.fetch_add(1, Ordering::Relaxed);
        }
        if !self.per_ip_conns.try_acquire(peer_ip) {
            self.active_total.fetch_sub(1, Ordering::Relaxed);
            return self.deny(DenyReason::PerIpCap);
        }
        AcceptDecision::Admit(ConnPermit {
            gate: Arc::clone(self),
            ip: peer_ip.to_string(),
        })
    }

    fn deny(&self, reason: DenyReason) -> AcceptDecision {
        self.drops.fetch_add(1, Ordering::Relaxed);
        AcceptDecision::Deny(reason)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active_total.load(Ordering::Relaxed)
    }
}
