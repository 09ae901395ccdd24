//! Connectivity probe
//!
//! Performs the CONNECT handshake for a destination and closes again without
//! exchanging application data. Used to check reachability and authorization
//! before a local connection exists, and to leave an audit record.

use iaptunnel_proto::TunnelDestination;
use iaptunnel_transport::TransportConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::connection::{ConnectionState, RelayConnection};
use crate::credential::CredentialSource;
use crate::error::RelayError;
use crate::AUDIT_TARGET;

/// How long to wait for an immediate rejection after the handshake succeeds
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// One-shot handshake-and-close against a destination
#[derive(Debug, Clone)]
pub struct TunnelProbe {
    transport: Arc<dyn TransportConnector>,
    destination: TunnelDestination,
    credentials: Arc<dyn CredentialSource>,
    config: RelayConfig,
    grace_period: Duration,
}

impl TunnelProbe {
    pub fn new(
        transport: Arc<dyn TransportConnector>,
        destination: TunnelDestination,
        credentials: Arc<dyn CredentialSource>,
        config: RelayConfig,
    ) -> Self {
        Self {
            transport,
            destination,
            credentials,
            config,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    /// Run the probe
    ///
    /// `Ok(())` when the relay accepted the session, `Unauthorized` when it
    /// refused the credential or destination, `Timeout` when no answer came
    /// within `timeout`. Handshake, grace period and close all share the one
    /// deadline.
    pub async fn run(&self, timeout: Duration) -> Result<(), RelayError> {
        let deadline = Instant::now() + timeout;
        let config = self
            .config
            .clone()
            .with_connect_timeout(timeout.min(self.config.connect_timeout));

        let open = RelayConnection::open(
            self.transport.clone(),
            self.destination.clone(),
            self.credentials.clone(),
            config,
        );

        let result = match tokio::time::timeout_at(deadline, open).await {
            Ok(Ok(connection)) => {
                let handle = connection.handle().clone();

                // The relay may accept CONNECT and reject right after
                let grace = self
                    .grace_period
                    .min(deadline.saturating_duration_since(Instant::now()));
                let early = tokio::time::timeout(grace, handle.closed()).await;
                let result = match (early, handle.fault()) {
                    (Ok(ConnectionState::Faulted), Some(err)) => Err(err),
                    _ => Ok(()),
                };

                // The driver keeps closing in the background past the deadline
                if tokio::time::timeout_at(deadline, connection.close())
                    .await
                    .is_err()
                {
                    debug!(destination = %self.destination, "Probe close still pending at deadline");
                }
                result
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RelayError::Timeout),
        };

        let outcome = match &result {
            Ok(()) => "ok",
            Err(RelayError::Unauthorized { .. }) => "unauthorized",
            Err(RelayError::Timeout) => "timeout",
            Err(_) => "error",
        };
        info!(
            target: AUDIT_TARGET,
            destination = %self.destination,
            outcome,
            "Tunnel probe finished"
        );

        result
    }
}
