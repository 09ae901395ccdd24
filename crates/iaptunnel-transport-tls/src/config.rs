//! TLS transport configuration

use iaptunnel_transport::{
    ClientCertificate, TransportError, TransportResult, TransportSecurityConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// TLS-specific configuration
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Security configuration
    pub(crate) security: TransportSecurityConfig,

    /// Relay host name or IP address
    pub relay_host: String,

    /// Relay port
    pub relay_port: u16,

    /// Server name for TLS verification (defaults to relay_host)
    pub server_name: Option<String>,

    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl TlsConfig {
    /// Create a client configuration with defaults
    pub fn new(relay_host: impl Into<String>, relay_port: u16) -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            relay_host: relay_host.into(),
            relay_port,
            server_name: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Parse "host:port", "host" (port 443) or "tls://host:port"
    pub fn from_address(address: &str) -> TransportResult<Self> {
        let without_scheme = address
            .trim_start_matches("tls://")
            .trim_start_matches("https://")
            .trim_end_matches('/');

        if without_scheme.is_empty() {
            return Err(TransportError::ConfigurationError(
                "Relay address is empty".to_string(),
            ));
        }

        if let Some(rest) = without_scheme.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                TransportError::ConfigurationError(format!(
                    "Unterminated IPv6 literal in relay address '{}'",
                    address
                ))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, address)?,
                None if tail.is_empty() => 443,
                None => {
                    return Err(TransportError::ConfigurationError(format!(
                        "Invalid relay address '{}'",
                        address
                    )))
                }
            };
            return Ok(Self::new(host, port));
        }

        match without_scheme.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                Ok(Self::new(host, parse_port(port, address)?))
            }
            // No port, or a bare IPv6 literal
            _ => Ok(Self::new(without_scheme, 443)),
        }
    }

    /// Set the TLS server name
    pub fn with_server_name(mut self, server_name: &str) -> Self {
        self.server_name = Some(server_name.to_string());
        self
    }

    /// Trust only the given DER-encoded root certificates
    pub fn with_root_certs(mut self, root_certs: Vec<Vec<u8>>) -> Self {
        self.security.root_certs = root_certs;
        self
    }

    /// Set custom TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    pub fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    pub fn effective_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.relay_host)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.relay_host.is_empty() {
            return Err(TransportError::ConfigurationError(
                "Relay host must not be empty".to_string(),
            ));
        }
        if self.relay_port == 0 {
            return Err(TransportError::ConfigurationError(
                "Relay port must not be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector, presenting `client_cert` if given
    pub(crate) fn build_tls_connector(
        &self,
        client_cert: Option<&ClientCertificate>,
    ) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        if self.security.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.security.root_certs {
                roots
                    .add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let builder = if self.security.verify_server_cert {
            rustls::ClientConfig::builder().with_root_certificates(roots)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        };

        let mut client_crypto = match client_cert {
            Some(cert) => {
                let chain = load_certs(&cert.cert_chain)?;
                let key = load_private_key(&cert.private_key)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid client cert: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        client_crypto.alpn_protocols = self
            .security
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

fn parse_port(port: &str, address: &str) -> TransportResult<u16> {
    port.parse().map_err(|_| {
        TransportError::ConfigurationError(format!(
            "Invalid port '{}' in relay address '{}'",
            port, address
        ))
    })
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(pem: &[u8]) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = pem;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(
            "No certificate found in client certificate chain".to_string(),
        ));
    }

    Ok(certs)
}

fn load_private_key(pem: &[u8]) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut reader = pem;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
