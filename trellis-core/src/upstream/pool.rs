//! Backend connection pool.
//!
//! Per-backend FIFOs of idle keep-alive connections. `acquire` hands out
//! the freshest healthy idle connection or dials a new one; `release`
//! with a keep-alive verdict returns the connection to the idle list,
//! anything else closes it. Idle entries expire after `idle_ttl` and are
//! liveness-checked (a closed or poisoned socket never leaves the pool).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use trellis_balance::BackendAddr;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub idle_ttl: Duration,
    pub max_idle_per_backend: usize,
    pub max_idle_total: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(30),
            max_idle_per_backend: 32,
            max_idle_total: 256,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<String, VecDeque<IdleConn>>,
    total_idle: usize,
    inflight: HashMap<String, usize>,
}

/// Shared pool, one per process.
pub struct ConnectionPool {
    cfg: PoolConfig,
    state: Mutex<PoolState>,
}

/// A borrowed upstream connection. Dropping it closes the socket;
/// `release(true)` returns it for reuse.
pub struct Lease {
    pub stream: TcpStream,
    /// True when this lease came from the idle list.
    pub reused: bool,
    backend_id: String,
    tracker: InflightGuard,
}

struct InflightGuard {
    pool: Arc<ConnectionPool>,
    backend_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        if let Some(count) = state.inflight.get_mut(&self.backend_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.inflight.remove(&self.backend_id);
            }
        }
    }
}

impl Lease {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Take the socket out of pool management entirely (tunnel
    /// takeover); it will never return to the idle list.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Finish with this connection. `keep_alive` means the response was
    /// cleanly parsed and the upstream allows reuse.
    pub fn release(self, keep_alive: bool) {
        let pool = Arc::clone(&self.tracker.pool);
        if keep_alive {
            pool.put_idle(&self.backend_id, self.stream);
        }
        // InflightGuard drop balances the counter; a non-keep-alive
        // stream is closed by dropping it here.
    }
}

impl ConnectionPool {
    pub fn new(cfg: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Get a connection to `backend`: freshest healthy idle entry, or a
    /// new connect bounded by `connect_timeout`.
    pub async fn acquire(self: &Arc<Self>, backend: &BackendAddr) -> io::Result<Lease> {
        let id = backend.id();
        while let Some(idle) = self.pop_idle(&id) {
            if idle.since.elapsed() > self.cfg.idle_ttl {
                trace!(backend = %id, "idle connection expired");
                continue;
            }
            if !connection_alive(&idle.stream) {
                trace!(backend = %id, "idle connection dead");
                continue;
            }
            debug!(backend = %id, "reusing pooled connection");
            return Ok(self.lease(id, idle.stream, true));
        }

        let stream = timeout(
            self.cfg.connect_timeout,
            TcpStream::connect((backend.ip.as_str(), backend.port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timeout"))??;
        stream.set_nodelay(true)?;
        debug!(backend = %id, "new upstream connection");
        Ok(self.lease(id, stream, false))
    }

    fn lease(self: &Arc<Self>, backend_id: String, stream: TcpStream, reused: bool) -> Lease {
        let mut state = self.state.lock();
        *state.inflight.entry(backend_id.clone()).or_insert(0) += 1;
        drop(state);
        Lease {
            stream,
            reused,
            backend_id: backend_id.clone(),
            tracker: InflightGuard {
                pool: Arc::clone(self),
                backend_id,
            },
        }
    }

    fn pop_idle(&self, backend_id: &str) -> Option<IdleConn> {
        let mut state = self.state.lock();
        let queue = state.idle.get_mut(backend_id)?;
        let conn = queue.pop_front();
        if conn.is_some() {
            state.total_idle -= 1;
        }
        if state
            .idle
            .get(backend_id)
            .map(VecDeque::is_empty)
            .unwrap_or(false)
        {
            state.idle.remove(backend_id);
        }
        conn
    }

    fn put_idle(&self, backend_id: &str, stream: TcpStream) {
        let mut state = self.state.lock();
        let evicted_oldest = {
            let queue = state.idle.entry(backend_id.to_string()).or_default();
            queue.push_back(IdleConn {
                stream,
                since: Instant::now(),
            });
            if queue.len() > self.cfg.max_idle_per_backend {
                queue.pop_front();
                true
            } else {
                false
            }
        };
        if !evicted_oldest {
            state.total_idle += 1;
        }
        // Global cap: evict the oldest idle entry anywhere.
        while state.total_idle > self.cfg.max_idle_total {
            let oldest_backend = state
                .idle
                .iter()
                .filter_map(|(k, q)| q.front().map(|c| (k.clone(), c.since)))
                .min_by_key(|(_, since)| *since)
                .map(|(k, _)| k);
            match oldest_backend {
                Some(k) => {
                    if let Some(q) = state.idle.get_mut(&k) {
                        q.pop_front();
                        let emptied = q.is_empty();
                        state.total_idle -= 1;
                        if emptied {
                            state.idle.remove(&k);
                        }
                    }
                }
                None => break,
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().total_idle
    }

    pub fn inflight_count(&self) -> usize {
        self.state.lock().inflight.values().sum()
    }

    /// Diagnostics JSON for `/admin/diagnose`.
    pub fn stats_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        let per_backend: HashMap<&str, usize> = state
            .idle
            .iter()
            .map(|(k, q)| (k.as_str(), q.len()))
            .collect();
        json!({
            "idle_total": state.total_idle,
            "idle_per_backend": per_backend,
            "inflight": &state.inflight,
        })
    }
}

/// A pooled socket is reusable iff reading would block: EOF means the
/// peer closed, and buffered bytes mean a poisoned exchange.
fn connection_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(_) => false,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn echo_backend() -> (BackendAddr, tokio::task::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut accepted = 0usize;
            loop {
                match listener.accept().await {
                    Ok((mut sock, _)) => {
                        accepted += 1;
                        tokio::spawn(async move {
                            let mut buf = [0u8; 1024];
                            while let Ok(n) = sock.read(&mut buf).await {
                                if n == 0 {
                                    break;
                                }
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
            accepted
        });
        (BackendAddr::new("127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn test_acquire_connects() {
        let (addr, _srv) = echo_backend().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let lease = pool.acquire(&addr).await.unwrap();
        assert!(!lease.reused);
        assert_eq!(pool.inflight_count(), 1);
        lease.release(false);
        assert_eq!(pool.inflight_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_reuse() {
        let (addr, _srv) = echo_backend().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let lease = pool.acquire(&addr).await.unwrap();
        lease.release(true);
        assert_eq!(pool.idle_count(), 1);

        let lease2 = pool.acquire(&addr).await.unwrap();
        assert!(lease2.reused, "released keep-alive lease must be reused");
        assert_eq!(pool.idle_count(), 0);
        lease2.release(false);
    }

    #[tokio::test]
    async fn test_expired_idle_not_reused() {
        let (addr, _srv) = echo_backend().await;
        let pool = ConnectionPool::new(PoolConfig {
            idle_ttl: Duration::from_millis(0),
            ..Default::default()
        });
        pool.acquire(&addr).await.unwrap().release(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let lease = pool.acquire(&addr).await.unwrap();
        assert!(!lease.reused);
        lease.release(false);
    }

    #[tokio::test]
    async fn test_dead_idle_not_reused() {
        let (addr, srv) = echo_backend().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        pool.acquire(&addr).await.unwrap().release(true);
        // Kill the backend; the pooled socket observes EOF.
        srv.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.acquire(&addr).await.is_err() || !pool.acquire(&addr).await.unwrap().reused);
    }

    #[tokio::test]
    async fn test_idle_caps() {
        let (addr, _srv) = echo_backend().await;
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_backend: 2,
            max_idle_total: 2,
            ..Default::default()
        });
        let l1 = pool.acquire(&addr).await.unwrap();
        let l2 = pool.acquire(&addr).await.unwrap();
        let l3 = pool.acquire(&addr).await.unwrap();
        l1.release(true);
        l2.release(true);
        l3.release(true);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let pool = ConnectionPool::new(PoolConfig {
            connect_timeout: Duration::from_millis(300),
            ..Default::default()
        });
        let dead = BackendAddr::new("127.0.0.1", 1);
        assert!(pool.acquire(&dead).await.is_err());
        assert_eq!(pool.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_release_balances_inflight() {
        let (addr, _srv) = echo_backend().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        {
            let _lease = pool.acquire(&addr).await.unwrap();
            assert_eq!(pool.inflight_count(), 1);
        }
        assert_eq!(pool.inflight_count(), 0);
    }
}
