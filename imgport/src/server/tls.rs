//! TLS setup for the upload server.
//!
//! The server terminates TLS itself: its key pair comes from PEM
//! strings, and client certificates are verified against a caller
//! supplied CA. Identity enforcement (the Common Name comparison)
//! happens per-request in the handler, which only needs the name
//! extracted here.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

use crate::errors::{ImportError, ImportResult};

/// PEM-encoded material for mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// Server private key.
    pub key_pem: String,
    /// Server certificate chain.
    pub cert_pem: String,
    /// CA bundle client certificates must chain to.
    pub client_ca_pem: String,
}

/// Build the rustls server configuration: present the server pair,
/// require a client certificate signed by the supplied CA.
pub(crate) fn server_config(material: &TlsMaterial) -> ImportResult<rustls::ServerConfig> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut material.cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| pem_error("server certificate", e))?;
    let key = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())
        .map_err(|e| pem_error("server key", e))?
        .ok_or_else(|| ImportError::Internal("no private key found in server key PEM".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut material.client_ca_pem.as_bytes()) {
        let cert = cert.map_err(|e| pem_error("client CA", e))?;
        roots
            .add(cert)
            .map_err(|e| ImportError::Internal(format!("client CA certificate rejected: {}", e)))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ImportError::Internal(format!("building client verifier: {}", e)))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ImportError::Internal(format!("building server TLS config: {}", e)))
}

fn pem_error(what: &str, err: std::io::Error) -> ImportError {
    ImportError::Internal(format!("reading {} PEM: {}", what, err))
}

/// Common Name of the leaf certificate the peer presented.
pub(crate) fn peer_common_name(certs: &[CertificateDer<'_>]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(certs.first()?.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}
