//! Certificate loading, validation, and atomic reload (spec §4.3).
//!
//! The store is read-mostly: readers dereference an `ArcSwap` pointer to an
//! immutable [`CertificateSet`] (spec §5); `reload` builds a brand-new set
//! off to the side and only publishes it if every check passes, so a failed
//! reload leaves the previous set in effect.

use crate::error::{Result, TunnelError};
use arc_swap::ArcSwap;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Filesystem paths the store loads from.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// An immutable, validated bundle of trust anchor + local identity.
pub struct CertificateSet {
    pub ca: Arc<RootCertStore>,
    pub identity_chain: Vec<CertificateDer<'static>>,
    pub identity_key: PrivateKeyDer<'static>,
    client_verifier: Arc<dyn ClientCertVerifier>,
}

impl CertificateSet {
    pub fn ca_store(&self) -> Arc<RootCertStore> {
        self.ca.clone()
    }
}

/// Owns the current [`CertificateSet`] and swaps it atomically on reload.
pub struct CertificateStore {
    current: ArcSwap<CertificateSet>,
    paths: CertPaths,
}

impl CertificateStore {
    /// Load and validate all three files, failing closed on any problem.
    pub fn load(paths: CertPaths) -> Result<Self> {
        let set = build_certificate_set(&paths)?;
        Ok(Self {
            current: ArcSwap::from_pointee(set),
            paths,
        })
    }

    pub fn current(&self) -> Arc<CertificateSet> {
        self.current.load_full()
    }

    /// Validate the files again and atomically publish on success. On
    /// failure the previous set remains in effect and the error is returned.
    pub fn reload(&self) -> Result<()> {
        let set = build_certificate_set(&self.paths)?;
        self.current.store(Arc::new(set));
        Ok(())
    }

    /// Enforce the trust anchor against a peer-presented chain.
    pub fn verify_peer(&self, presented_chain: &[CertificateDer<'static>]) -> Result<()> {
        let set = self.current();
        let (end_entity, intermediates) = presented_chain
            .split_first()
            .ok_or_else(|| TunnelError::PeerAuthFailed("empty certificate chain".to_string()))?;
        set.client_verifier
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
            .map(|_| ())
            .map_err(|e| TunnelError::PeerAuthFailed(e.to_string()))
    }
}

fn build_certificate_set(paths: &CertPaths) -> Result<CertificateSet> {
    check_permissions(&paths.key_file, 0o600)?;
    check_permissions(&paths.cert_file, 0o644)?;

    let ca_bytes = read_file(&paths.ca_file)?;
    let mut ca = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_bytes.as_slice()) {
        let cert = cert.map_err(|e| TunnelError::CertParseError(e.to_string()))?;
        ca.add(cert)
            .map_err(|e| TunnelError::CertChainInvalid(e.to_string()))?;
    }
    if ca.is_empty() {
        return Err(TunnelError::CertChainInvalid(
            "CA file contains no certificates".to_string(),
        ));
    }
    let ca = Arc::new(ca);

    let cert_bytes = read_file(&paths.cert_file)?;
    let identity_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| TunnelError::CertParseError(e.to_string()))?;
    if identity_chain.is_empty() {
        return Err(TunnelError::CertNotFound(
            paths.cert_file.display().to_string(),
        ));
    }

    validate_expiry(&identity_chain[0])?;
    validate_chain(&ca, &identity_chain)?;

    let key_bytes = read_file(&paths.key_file)?;
    let identity_key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| TunnelError::CertParseError(e.to_string()))?
        .ok_or_else(|| TunnelError::CertNotFound(paths.key_file.display().to_string()))?;

    let client_verifier = WebPkiClientVerifier::builder(ca.clone())
        .build()
        .map_err(|e| TunnelError::CertChainInvalid(e.to_string()))?;

    Ok(CertificateSet {
        ca,
        identity_chain,
        identity_key,
        client_verifier,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TunnelError::CertNotFound(path.display().to_string()),
        _ => TunnelError::Io(e),
    })
}

fn validate_expiry(cert: &CertificateDer<'static>) -> Result<()> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| TunnelError::CertParseError(e.to_string()))?;
    let validity = parsed.validity();
    let now = SystemTime::now();
    let not_before = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(
        validity.not_before.timestamp().max(0) as u64,
    );
    let not_after = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(
        validity.not_after.timestamp().max(0) as u64,
    );
    if now < not_before {
        return Err(TunnelError::CertNotYetValid(not_before));
    }
    if now > not_after {
        return Err(TunnelError::CertExpired(not_after));
    }
    Ok(())
}

fn validate_chain(
    ca: &RootCertStore,
    chain: &[CertificateDer<'static>],
) -> Result<()> {
    // A minimal chain-to-anchor check via the same webpki machinery rustls
    // uses at handshake time, run once up front so load()/reload() fail
    // before anything is ever negotiated over the wire.
    let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(ca.clone()))
        .build()
        .map_err(|e| TunnelError::CertChainInvalid(e.to_string()))?;
    let server_name = rustls_pki_types::ServerName::IpAddress(
        rustls_pki_types::IpAddr::from(std::net::Ipv4Addr::UNSPECIFIED),
    );
    match verifier.verify_server_cert(
        &chain[0],
        &chain[1..],
        &server_name,
        &[],
        UnixTime::now(),
    ) {
        Ok(_) => Ok(()),
        // A name mismatch still proves the chain itself validated against
        // the anchor; any other error means the chain is genuinely invalid.
        Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::NotValidForName,
        )) => Ok(()),
        Err(e) => Err(TunnelError::CertChainInvalid(e.to_string())),
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path, max_mode: u32) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TunnelError::CertNotFound(path.display().to_string()),
        _ => TunnelError::Io(e),
    })?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & !max_mode != 0 {
        return Err(TunnelError::KeyPermissionsUnsafe {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path, _max_mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Minimal self-signed CA + leaf pair, generated once for the test
    // process via a tiny inline PEM fixture would require rcgen; instead
    // these tests exercise the parts that don't need a real certificate.

    #[test]
    fn check_permissions_rejects_group_readable_key() {
        let dir = std::env::temp_dir().join(format!("certstore-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("key.pem");
        {
            let mut f = fs::File::create(&key_path).unwrap();
            f.write_all(b"dummy").unwrap();
        }
        #[cfg(unix)]
        {
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o640)).unwrap();
            assert!(check_permissions(&key_path, 0o600).is_err());
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600)).unwrap();
            assert!(check_permissions(&key_path, 0o600).is_ok());
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_file_reports_not_found() {
        let err = read_file(Path::new("/nonexistent/path/does-not-exist.pem")).unwrap_err();
        assert_eq!(err.code(), "security.cert_not_found");
    }
}
