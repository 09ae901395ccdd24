//! TLS connector for establishing outgoing relay connections

use async_trait::async_trait;
use iaptunnel_transport::{
    BoxedTransportStream, ClientCertificate, TransportConnector, TransportError, TransportResult,
};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::TlsConfig;

/// TLS connector for the relay endpoint
pub struct TlsConnector {
    /// Connector used when no client certificate is presented
    anonymous: tokio_rustls::TlsConnector,
    config: Arc<TlsConfig>,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("relay_host", &self.config.relay_host)
            .field("relay_port", &self.config.relay_port)
            .finish()
    }
}

impl TlsConnector {
    pub fn new(config: TlsConfig) -> TransportResult<Self> {
        config.validate()?;

        let anonymous = config.build_tls_connector(None)?;

        debug!("TLS connector created for {}", config.relay_host);

        Ok(Self {
            anonymous,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

#[async_trait]
impl TransportConnector for TlsConnector {
    async fn connect(
        &self,
        client_cert: Option<&ClientCertificate>,
    ) -> TransportResult<BoxedTransportStream> {
        let host = self.config.relay_host.as_str();
        let port = self.config.relay_port;

        debug!(
            "Connecting to relay {}:{} (client certificate: {})",
            host,
            port,
            client_cert.is_some()
        );

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;

        let _ = tcp_stream.set_nodelay(true);

        let tls_connector = match client_cert {
            Some(cert) => self.config.build_tls_connector(Some(cert))?,
            None => self.anonymous.clone(),
        };

        let server_name = ServerName::try_from(self.config.effective_server_name().to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = tokio::time::timeout(
            self.config.connect_timeout,
            tls_connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        info!("TLS connection established to {}", self.endpoint());

        Ok(Box::new(tls_stream))
    }

    fn endpoint(&self) -> String {
        format!("tls://{}:{}", self.config.relay_host, self.config.relay_port)
    }

    fn is_encrypted(&self) -> bool {
        true
    }
}
