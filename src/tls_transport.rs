//! TLS 1.3 mutually-authenticated transport (spec §4.4).
//!
//! Builds `rustls` client/server configs from a [`CertificateSet`] and
//! exposes `dial`/`accept` returning a boxed, reliable, ordered, authenticated
//! byte stream. On any TLS error the stream's next I/O call returns a
//! terminal error — `tokio_rustls` already surfaces this by failing further
//! reads/writes once the underlying connection state is poisoned, so no
//! extra state machine is needed here.

use crate::cert_store::CertificateSet;
use crate::config::TlsVersion;
use crate::error::{Result, TunnelError};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A reliable, ordered, authenticated byte stream. Boxed so callers don't
/// need to name the concrete `tokio_rustls` stream type.
pub type Stream = Box<dyn AsyncReadWrite + Send + Unpin>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncReadWrite for T {}

fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match (min, max) {
        (TlsVersion::V1_3, _) => &rustls::ALL_VERSIONS[..1], // TLS1.3 only
        (TlsVersion::V1_2, TlsVersion::V1_2) => &rustls::ALL_VERSIONS[1..2],
        (TlsVersion::V1_2, TlsVersion::V1_3) => rustls::ALL_VERSIONS,
    }
}

fn client_config(cert_set: &CertificateSet, min: TlsVersion, max: TlsVersion) -> Result<ClientConfig> {
    let versions = protocol_versions(min, max);
    let builder = ClientConfig::builder_with_protocol_versions(versions);
    let verifier = rustls::client::WebPkiServerVerifier::builder(cert_set.ca_store())
        .build()
        .map_err(|e| TunnelError::TlsHandshakeFailed(e.to_string()))?;
    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(cert_set.identity_chain.clone(), cert_set.identity_key.clone_key())
        .map_err(|e| TunnelError::TlsHandshakeFailed(e.to_string()))?;
    config.alpn_protocols = vec![b"tunnel/1".to_vec()];
    Ok(config)
}

fn server_config(cert_set: &CertificateSet, min: TlsVersion, max: TlsVersion) -> Result<ServerConfig> {
    let versions = protocol_versions(min, max);
    let client_verifier = WebPkiClientVerifier::builder(cert_set.ca_store())
        .build()
        .map_err(|e| TunnelError::TlsHandshakeFailed(e.to_string()))?;
    let builder = ServerConfig::builder_with_protocol_versions(versions).with_client_cert_verifier(client_verifier);
    let mut config = builder
        .with_single_cert(cert_set.identity_chain.clone(), cert_set.identity_key.clone_key())
        .map_err(|e| TunnelError::TlsHandshakeFailed(e.to_string()))?;
    config.alpn_protocols = vec![b"tunnel/1".to_vec()];
    Ok(config)
}

/// Dial a remote peer and perform the client-side mutual TLS handshake.
pub async fn dial(
    addr: SocketAddr,
    server_name: &str,
    cert_set: &CertificateSet,
    min: TlsVersion,
    max: TlsVersion,
    connect_timeout: Duration,
) -> Result<Stream> {
    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::DeadlineExceeded)?
        .map_err(|e| TunnelError::ConnectionRefused(e.to_string()))?;
    tune_socket(&tcp);

    let config = client_config(cert_set, min, max)?;
    let connector = TlsConnector::from(Arc::new(config));
    let name = rustls_pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|_| TunnelError::TlsHandshakeFailed(format!("invalid server name {server_name}")))?;
    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|e| TunnelError::TlsHandshakeFailed(e.to_string()))?;
    Ok(Box::new(stream))
}

/// Accept one inbound connection and perform the server-side mutual TLS
/// handshake, requiring the peer to present a certificate chaining to the
/// same trust anchor.
pub async fn accept(
    listener: &TcpListener,
    cert_set: &CertificateSet,
    min: TlsVersion,
    max: TlsVersion,
) -> Result<(Stream, SocketAddr)> {
    let (tcp, peer_addr) = listener
        .accept()
        .await
        .map_err(|e| TunnelError::ConnectionRefused(e.to_string()))?;
    tune_socket(&tcp);

    let config = server_config(cert_set, min, max)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let stream = acceptor
        .accept(tcp)
        .await
        .map_err(|e| TunnelError::TlsHandshakeFailed(e.to_string()))?;
    Ok((Box::new(stream), peer_addr))
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let _ = sock_ref.set_nodelay(true);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls13_only_selects_single_version() {
        let versions = protocol_versions(TlsVersion::V1_3, TlsVersion::V1_3);
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn floor_1_2_ceiling_1_3_selects_both() {
        let versions = protocol_versions(TlsVersion::V1_2, TlsVersion::V1_3);
        assert_eq!(versions.len(), 2);
    }
}
