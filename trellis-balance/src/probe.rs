//! Probe I/O shared by the health, AI and warmup checkers.
//!
//! Probes speak deliberately minimal HTTP/1.0 with `Connection: close` so
//! the whole exchange is one connect/write/read-to-eof and needs no
//! keep-alive bookkeeping.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::backend::BackendAddr;

/// Largest probe response we bother reading.
const MAX_PROBE_RESPONSE: usize = 256 * 1024;

/// TCP connect within `limit`.
pub async fn tcp_probe(addr: &BackendAddr, limit: Duration) -> bool {
    matches!(
        timeout(limit, TcpStream::connect((addr.ip.as_str(), addr.port))).await,
        Ok(Ok(_))
    )
}

/// `GET <path>` with HTTP/1.0 semantics; returns (status, body).
pub async fn http_get(
    addr: &BackendAddr,
    host: &str,
    path: &str,
    limit: Duration,
) -> std::io::Result<(u16, Vec<u8>)> {
    let request = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    http_exchange(addr, request.into_bytes(), limit).await
}

/// `POST <path>` with an empty body; returns the status.
pub async fn http_post(
    addr: &BackendAddr,
    host: &str,
    path: &str,
    limit: Duration,
) -> std::io::Result<u16> {
    let request = format!(
        "POST {path} HTTP/1.0\r\nHost: {host}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    let (status, _) = http_exchange(addr, request.into_bytes(), limit).await?;
    Ok(status)
}

/// Healthy iff the probe answered 2xx/3xx within the timeout.
pub async fn http_probe(addr: &BackendAddr, host: &str, path: &str, limit: Duration) -> bool {
    matches!(http_get(addr, host, path, limit).await, Ok((status, _)) if (200..400).contains(&status))
}

/// Run a shell command; exit status 0 means healthy. The backend id is
/// appended as the last argument.
pub async fn script_probe(command: &str, backend_id: &str, limit: Duration) -> bool {
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(format!("{command} {backend_id}"))
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    match timeout(limit, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        // Timeout or wait error: kill_on_drop reaps the child.
        _ => false,
    }
}

async fn http_exchange(
    addr: &BackendAddr,
    request: Vec<u8>,
    limit: Duration,
) -> std::io::Result<(u16, Vec<u8>)> {
    timeout(limit, async {
        let mut stream = TcpStream::connect((addr.ip.as_str(), addr.port)).await?;
        stream.write_all(&request).await?;
        let mut raw = Vec::with_capacity(1024);
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            if raw.len() > MAX_PROBE_RESPONSE {
                break;
            }
        }
        parse_probe_response(&raw)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad probe response"))
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timed out"))?
}

/// Status code + body after the blank line. Probes never request chunked
/// responses (HTTP/1.0), so the body runs to EOF.
fn parse_probe_response(raw: &[u8]) -> Option<(u16, Vec<u8>)> {
    let head_end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..head_end]).ok()?;
    let status_line = head.lines().next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    Some((status, raw[head_end + 4..].to_vec()))
}
