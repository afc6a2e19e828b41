//! TLS acceptor construction from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore, ServerConnection, crypto::ring};

use super::ServerError;
use crate::config::TlsConfig;

/// Builds a TLS acceptor from the certificate chain and private key in `tls`.
///
/// # Errors
///
/// [`ServerError::Tls`] if a file cannot be read, holds no usable key, or
/// rustls rejects the certificate/key pair.
pub fn load_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(&tls.cert_path)?;

    let key = rustls_pemfile::private_key(&mut open(&tls.key_path)?)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", tls.key_path.display())))?
        .ok_or_else(|| {
            ServerError::Tls(format!("no private key found in {}", tls.key_path.display()))
        })?;

    let provider = Arc::new(ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;
    let builder = match &tls.client_ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for ca in load_certs(ca_path)? {
                roots.add(ca)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| ServerError::Tls(format!("{}: {e}", ca_path.display())))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let config = builder.with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The identity of a client that presented a verified certificate:
/// `sha256:` followed by the hex fingerprint of its leaf certificate.
pub fn client_identity(connection: &ServerConnection) -> Option<String> {
    let leaf = connection.peer_certificates()?.first()?;
    Some(fingerprint(leaf))
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(cert.as_ref())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn open(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))
}
