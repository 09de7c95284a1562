//! TLS termination setup.
//!
//! Builds a rustls server configuration from a PEM certificate chain and a
//! PEM private key, either from files or from raw bytes.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::ListenError;

/// Load a certificate chain and key from disk and build an acceptor.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ListenError> {
    let cert_pem = std::fs::read(cert_path).map_err(|source| ListenError::Certificate {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key_pem = std::fs::read(key_path).map_err(|source| ListenError::Certificate {
        path: key_path.to_path_buf(),
        source,
    })?;

    let acceptor = acceptor_from_pem(&cert_pem, &key_pem)?;
    info!(
        cert_path = %cert_path.display(),
        key_path = %key_path.display(),
        "Loaded TLS certificate"
    );
    Ok(acceptor)
}

/// Build an acceptor from in-memory PEM material.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, ListenError> {
    let config = server_config(cert_pem, key_pem)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig, ListenError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(ListenError::Pem)?;
    if certs.is_empty() {
        return Err(ListenError::NoCertificates);
    }

    // Accepts PKCS#8, PKCS#1 and SEC1 keys; the first one found wins.
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(ListenError::Pem)?
        .ok_or(ListenError::NoPrivateKey)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(config)
}
