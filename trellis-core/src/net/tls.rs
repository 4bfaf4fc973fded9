//! TLS termination with first-byte sniffing.
//!
//! When a certificate is configured the first inbound byte is peeked:
//! 0x16 (TLS handshake record) starts a rustls handshake, anything else
//! serves plaintext on the same socket. Without a certificate everything
//! is plaintext.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::stream::ClientStream;
use crate::error::ProxyError;

const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Build an acceptor from PEM files.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                ProxyError::Tls(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no private key in key file",
                ))
            })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Sniff and (maybe) terminate TLS on an accepted socket.
pub async fn maybe_terminate(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> Result<ClientStream, ProxyError> {
    let acceptor = match acceptor {
        Some(a) => a,
        None => return Ok(ClientStream::Plain(stream)),
    };

    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await.map_err(ProxyError::Tls)?;
    if n == 1 && first[0] == TLS_HANDSHAKE_BYTE {
        let tls = acceptor.accept(stream).await.map_err(ProxyError::Tls)?;
        debug!("tls handshake complete");
        Ok(ClientStream::Tls(Box::new(tls)))
    } else {
        debug!("plaintext client on tls-enabled listener");
        Ok(ClientStream::Plain(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_acceptor_passes_through() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let stream = maybe_terminate(accepted, None).await.unwrap();
        assert!(!stream.is_tls());
        let _ = client.await;
    }

    #[tokio::test]
    async fn test_missing_cert_file_errors() {
        let err = build_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(err.is_err());
    }
}
