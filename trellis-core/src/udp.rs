//! UDP datagram proxy.
//!
//! Each client address gets a session: a connected upstream socket plus
//! a task pumping replies back through the listening socket. Sessions
//! idle past the timeout are swept periodically; forwarding failures
//! land in the drop counter.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trellis_balance::BackendManager;

use crate::stats::Metrics;

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UdpProxyConfig {
    pub listen_port: u16,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for UdpProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            idle_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

struct UdpSession {
    upstream: Arc<UdpSocket>,
    /// Milliseconds since proxy start, updated on both directions.
    last_active_ms: Arc<AtomicU64>,
    pump: JoinHandle<()>,
}

/// Run the datagram proxy until the task is aborted.
pub fn spawn(
    cfg: UdpProxyConfig,
    manager: Arc<BackendManager>,
    metrics: Arc<Metrics>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        let listen = Arc::new(UdpSocket::bind(("0.0.0.0", cfg.listen_port)).await?);
        info!(port = cfg.listen_port, "udp proxy listening");
        let sessions: Arc<DashMap<SocketAddr, UdpSession>> = Arc::new(DashMap::new());
        let epoch = Instant::now();

        // Idle sweep.
        {
            let sessions = Arc::clone(&sessions);
            let idle = cfg.idle_timeout;
            let every = cfg.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    sessions.retain(|client, session| {
                        let age_ms =
                            now_ms.saturating_sub(session.last_active_ms.load(Ordering::Relaxed));
                        let keep = Duration::from_millis(age_ms) <= idle;
                        if !keep {
                            debug!(%client, "udp session idle, closed");
                            session.pump.abort();
                        }
                        keep
                    });
                }
            });
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, client) = listen.recv_from(&mut buf).await?;
            metrics.add_bytes_in(len as u64);
            let now_ms = epoch.elapsed().as_millis() as u64;

            // Copy the handles out before awaiting; the map guard must
            // not live across a suspension point.
            let existing = sessions.get(&client).map(|session| {
                session.last_active_ms.store(now_ms, Ordering::Relaxed);
                Arc::clone(&session.upstream)
            });
            if let Some(upstream) = existing {
                if upstream.send(&buf[..len]).await.is_err() {
                    metrics.add_udp_rx_drops(1);
                }
                continue;
            }

            // New client: pick a backend and open a connected socket.
            let backend = match manager.select(&client.to_string()) {
                Some(b) => b,
                None => {
                    metrics.add_udp_rx_drops(1);
                    continue;
                }
            };
            let upstream = match UdpSocket::bind(("0.0.0.0", 0)).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(%err, "udp upstream socket failed");
                    metrics.add_udp_rx_drops(1);
                    continue;
                }
            };
            if upstream
                .connect((backend.ip.as_str(), backend.port))
                .await
                .is_err()
            {
                manager.report_failure(&backend.id());
                metrics.add_udp_rx_drops(1);
                continue;
            }
            let upstream = Arc::new(upstream);
            debug!(%client, backend = %backend, "udp session opened");

            let last_active_ms = Arc::new(AtomicU64::new(now_ms));
            let pump = {
                let upstream = Arc::clone(&upstream);
                let listen = Arc::clone(&listen);
                let last_active_ms = Arc::clone(&last_active_ms);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    let mut reply = vec![0u8; MAX_DATAGRAM];
                    loop {
                        match upstream.recv(&mut reply).await {
                            Ok(n) => {
                                last_active_ms
                                    .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                                if listen.send_to(&reply[..n], client).await.is_ok() {
                                    metrics.add_bytes_out(n as u64);
                                } else {
                                    metrics.add_udp_rx_drops(1);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                })
            };

            if upstream.send(&buf[..len]).await.is_err() {
                metrics.add_udp_rx_drops(1);
            }
            sessions.insert(
                client,
                UdpSession {
                    upstream,
                    last_active_ms,
                    pump,
                },
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// End-to-end datagram round trip through the proxy.
    #[tokio::test]
    async fn test_udp_round_trip() {
        // Echo backend.
        let backend_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend_socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = backend_socket.recv_from(&mut buf).await {
                let _ = backend_socket.send_to(&buf[..n], from).await;
            }
        });

        let manager = Arc::new(BackendManager::new("roundrobin"));
        manager.add("127.0.0.1", backend_port, 1);
        let metrics = Arc::new(Metrics::new());

        // Pick a free port by binding and dropping.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = probe.local_addr().unwrap().port();
        drop(probe);

        let _proxy = spawn(
            UdpProxyConfig {
                listen_port: proxy_port,
                idle_timeout: Duration::from_secs(5),
                cleanup_interval: Duration::from_millis(100),
            },
            manager,
            Arc::clone(&metrics),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .connect(("127.0.0.1", proxy_port))
            .await
            .unwrap();
        client.send(b"ping").await.unwrap();

        let mut reply = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..n], b"ping");
    }
}
