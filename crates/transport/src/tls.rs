//! Mutual TLS configuration.
//!
//! Trust material is read from disk every time a configuration is built, so rotated
//! certificates are picked up by the next connection without a restart.

use crate::{TransportError, TransportResult};
use relay_certificates::{
    CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE,
};
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Locations of the PEM files one side of a connection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    /// CA certificate used to verify the peer.
    pub ca_cert: PathBuf,
    /// This side's certificate chain.
    pub cert: PathBuf,
    /// This side's private key.
    pub key: PathBuf,
}

impl TlsPaths {
    /// Server-side files in `dir`, using the standard bundle names.
    pub fn server_in(dir: &Path) -> Self {
        Self {
            ca_cert: dir.join(CA_CERT_FILE),
            cert: dir.join(SERVER_CERT_FILE),
            key: dir.join(SERVER_KEY_FILE),
        }
    }

    /// Client-side files in `dir`, using the standard bundle names.
    pub fn client_in(dir: &Path) -> Self {
        Self {
            ca_cert: dir.join(CA_CERT_FILE),
            cert: dir.join(CLIENT_CERT_FILE),
            key: dir.join(CLIENT_KEY_FILE),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(path: &Path, e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(format!("{}: {}", path.display(), e))
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| tls_error(path, e))
}

fn load_roots(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| tls_error(path, e))?;
    }
    Ok(roots)
}

/// Builds a client configuration that presents `paths.cert` and trusts only `paths.ca_cert`.
///
/// # Errors
///
/// Returns `TransportError::Tls` if any file is missing or unreadable, or the key is not
/// usable with the certificate.
pub fn client_config(paths: &TlsPaths) -> TransportResult<Arc<ClientConfig>> {
    let roots = load_roots(&paths.ca_cert)?;
    let certs = load_certs(&paths.cert)?;
    let key = load_key(&paths.key)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(&paths.key, e))?;
    Ok(Arc::new(config))
}

/// Builds a server configuration that requires a client certificate chained to
/// `paths.ca_cert`.
///
/// # Errors
///
/// Same as [`client_config`].
pub fn server_config(paths: &TlsPaths) -> TransportResult<Arc<ServerConfig>> {
    let roots = load_roots(&paths.ca_cert)?;
    let certs = load_certs(&paths.cert)?;
    let key = load_key(&paths.key)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| tls_error(&paths.ca_cert, e))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| tls_error(&paths.key, e))?;
    Ok(Arc::new(config))
}
