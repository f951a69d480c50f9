//! rustls server configuration for the TLS listener.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::AppError;
use crate::identity::TlsMaterial;

/// Build an acceptor from PEM material produced by the bootstrapper.
pub fn acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, AppError> {
    Ok(TlsAcceptor::from(server_config(material)?))
}

pub fn server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>, AppError> {
    let certs = parse_certificates(&material.cert_pem)?;
    let key = parse_private_key(&material.key_pem)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::Tls(format!("protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::Tls(format!("server config error: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Parse PEM-encoded certificates.
fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, AppError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(AppError::Tls("no certificate found in PEM".into()));
    }
    Ok(certs)
}

/// Parse a PEM-encoded private key.
fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, AppError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| AppError::Tls(format!("failed to parse private key: {e}")))
}
