//! Credentials presented to the relay
//!
//! Credentials are read once per connection attempt, so a token refreshed by
//! the authorization collaborator between reconnects is picked up.

use async_trait::async_trait;
use iaptunnel_proto::{BearerToken, CloseCode};
use iaptunnel_transport::ClientCertificate;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RelayError;

/// Bearer token plus an optional mutual-TLS client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredential {
    pub token: BearerToken,
    pub client_certificate: Option<ClientCertificate>,
}

impl RelayCredential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: BearerToken::new(token),
            client_certificate: None,
        }
    }

    pub fn with_client_certificate(mut self, certificate: ClientCertificate) -> Self {
        self.client_certificate = Some(certificate);
        self
    }
}

/// Source of the credential for each connection attempt
#[async_trait]
pub trait CredentialSource: Send + Sync + Debug {
    async fn credential(&self) -> Result<RelayCredential, RelayError>;
}

/// A credential that never changes
#[derive(Debug, Clone)]
pub struct StaticCredential(RelayCredential);

impl StaticCredential {
    pub fn new(credential: RelayCredential) -> Self {
        Self(credential)
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn credential(&self) -> Result<RelayCredential, RelayError> {
        Ok(self.0.clone())
    }
}

/// A credential cell that can be refreshed while connections are live
#[derive(Debug, Clone, Default)]
pub struct SharedCredential {
    inner: Arc<RwLock<Option<RelayCredential>>>,
}

impl SharedCredential {
    pub fn new(credential: RelayCredential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(credential))),
        }
    }

    /// Replace the credential used by subsequent connection attempts
    pub async fn update(&self, credential: RelayCredential) {
        *self.inner.write().await = Some(credential);
    }

    /// Revoke the credential; later attempts fail as unauthorized
    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

#[async_trait]
impl CredentialSource for SharedCredential {
    async fn credential(&self) -> Result<RelayCredential, RelayError> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or_else(|| RelayError::Unauthorized {
                code: CloseCode::NOT_AUTHORIZED,
                reason: "no credential available".to_string(),
            })
    }
}
