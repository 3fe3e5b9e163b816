//! TLS server material.
//!
//! The negotiation core only ever sees a ready [`TlsAcceptor`]; this module
//! builds one from PEM data.

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::{Arc, Once};

use rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::XmppError;

/// Install the ring crypto provider for rustls.
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn install_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("A rustls crypto provider was already installed");
        }
    });
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, XmppError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert_pem)))
            .collect::<Result<_, _>>()
            .map_err(|e| XmppError::config(format!("Invalid certificate PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(XmppError::config("No certificate found"));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(Cursor::new(key_pem)))
        .map_err(|e| XmppError::config(format!("Invalid private key PEM: {}", e)))?
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Load a TLS acceptor from PEM files on disk.
pub fn load_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, XmppError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        XmppError::config(format!(
            "Failed to open cert file {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        XmppError::config(format!(
            "Failed to open key file {}: {}",
            key_path.display(),
            e
        ))
    })?;

    acceptor_from_pem(&cert_pem, &key_pem)
}

/// Acceptor with a throwaway self-signed certificate for `localhost`.
#[cfg(test)]
pub(crate) fn test_acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    acceptor_from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes()).unwrap()
}
