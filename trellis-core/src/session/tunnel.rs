//! L4 byte splice.
//!
//! Used for WebSocket takeovers and the raw L4 listener. Both directions
//! copy through bounded buffers; a slow reader exerts back-pressure on
//! the opposite side because the copy only reads again after the write
//! completes. Either side closing shuts the other down symmetrically.

use std::io;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tracing::debug;

use crate::stats::Metrics;

/// Splice until either side closes. Returns (client→upstream,
/// upstream→client) byte counts.
pub async fn splice<A, B>(client: &mut A, upstream: &mut B, metrics: &Metrics) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = copy_bidirectional(client, upstream).await;
    match result {
        Ok((to_upstream, to_client)) => {
            metrics.add_bytes_in(to_upstream);
            metrics.add_bytes_out(to_client);
            debug!(to_upstream, to_client, "tunnel closed");
            Ok((to_upstream, to_client))
        }
        Err(err) => {
            debug!(%err, "tunnel aborted");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_bidirectional_echo() {
        let metrics = Metrics::new();

        // upstream echoes everything back
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // proxy side
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut client, _) = proxy_listener.accept().await.unwrap();
            let mut upstream = TcpStream::connect(upstream_addr).await.unwrap();
            let _ = splice(&mut client, &mut upstream, &metrics).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
