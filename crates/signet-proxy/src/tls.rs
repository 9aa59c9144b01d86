//! TLS termination and origin connection setup.
//!
//! The client-facing side terminates TLS with a leaf certificate resolved
//! from the ClientHello SNI (falling back to the CONNECT authority host);
//! the origin-facing side validates against the webpki root store unless
//! verification has been explicitly disabled.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::ca::RootAuthority;
use crate::error::ProxyError;

/// ALPN value offered on both sides. HTTP/2 is deliberately not advertised;
/// the pipeline speaks HTTP/1.1 only.
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Builds the client-facing TLS configuration for one intercepted tunnel.
///
/// Certificates are resolved per-handshake: the SNI from the ClientHello
/// wins, and clients that omit SNI get a leaf for the CONNECT authority.
pub fn server_config(authority: Arc<RootAuthority>, fallback_host: &str) -> Arc<ServerConfig> {
    let resolver = Arc::new(LeafResolver {
        authority,
        fallback: fallback_host.to_string(),
    });
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Arc::new(config)
}

/// Resolves leaf certificates on demand from the CA cache.
struct LeafResolver {
    authority: Arc<RootAuthority>,
    fallback: String,
}

impl std::fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafResolver")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for LeafResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let host = client_hello.server_name().unwrap_or(&self.fallback);
        debug!(host, "resolving leaf certificate");
        match self.authority.sign_leaf(host) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::error!(host, error = %e, "failed to sign leaf certificate");
                None
            }
        }
    }
}

/// TLS connector for origin-facing handshakes.
#[derive(Clone)]
pub struct OriginConnector {
    connector: TlsConnector,
}

impl OriginConnector {
    /// Creates a connector validating origins against the webpki roots.
    pub fn new() -> Self {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Creates a connector that accepts any origin certificate.
    ///
    /// This removes all protection against impersonation of the origin.
    pub fn insecure() -> Self {
        tracing::warn!("origin certificate verification is DISABLED");
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Performs the TLS client handshake with the origin over `stream`.
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::TlsHandshake(invalid_name(host)))?;
        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(ProxyError::TlsHandshake)?;
        debug!(host, "origin TLS connection established");
        Ok(tls_stream)
    }
}

impl Default for OriginConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_name(host: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("invalid server name: {host:?}"),
    )
}

/// Accepts every origin certificate. Only reachable through
/// [`OriginConnector::insecure`].
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
