//! TLS helpers for explicit FTPS (RFC 4217).
//!
//! - Builds one rustls client config per session, optionally accepting
//!   self-signed certificates.
//! - The same connector wraps the control connection after `AUTH TLS` and
//!   every protected data connection, so servers that insist on TLS
//!   session reuse for data connections see a resumed session.

use crate::ftp::error::{FtpError, FtpResult};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Connector plus the name every handshake verifies against.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Build the TLS context for `host`.
    pub fn new(host: &str, accept_invalid_certs: bool) -> FtpResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::warn!("Skipping unreadable system certificate store entry: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("TLS roots: {} loaded, {} ignored", added, ignored);

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        if accept_invalid_certs {
            log::warn!("TLS certificate verification disabled for {}", host);
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertVerifier));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FtpError::tls(format!("Invalid server name '{}': {}", host, e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Run the client handshake over `tcp`.
    pub async fn wrap(&self, tcp: TcpStream, what: &str) -> FtpResult<TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| FtpError::tls(format!("{} TLS handshake failed: {}", what, e)))
    }
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
