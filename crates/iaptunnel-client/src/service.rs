//! Tunnel service
//!
//! Owns the relay transport and configuration shared by all tunnels of a
//! process, and keeps track of the tunnels it created.

use iaptunnel_connection::{CredentialSource, RelayConfig, RelayError, TunnelProbe};
use iaptunnel_proto::TunnelDestination;
use iaptunnel_transport::TransportConnector;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::TunnelError;
use crate::peer::{PeerResolver, ProcfsPeerResolver};
use crate::policy::RelayPolicy;
use crate::tunnel::{Tunnel, TunnelId, TunnelParams};

/// Creates and tracks tunnels
#[derive(Debug)]
pub struct TunnelService {
    transport: Arc<dyn TransportConnector>,
    config: RelayConfig,
    resolver: Arc<dyn PeerResolver>,
    listen_ip: IpAddr,
    tunnels: RwLock<HashMap<TunnelId, Arc<Tunnel>>>,
    shut_down: AtomicBool,
}

impl TunnelService {
    pub fn new(transport: Arc<dyn TransportConnector>, config: RelayConfig) -> Self {
        Self {
            transport,
            config,
            resolver: Arc::new(ProcfsPeerResolver::new()),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tunnels: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Use a different strategy for identifying local callers
    pub fn with_peer_resolver(mut self, resolver: Arc<dyn PeerResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Bind tunnels on this loopback address instead of 127.0.0.1
    pub fn with_listen_ip(mut self, listen_ip: IpAddr) -> Self {
        self.listen_ip = listen_ip;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Create a tunnel on an ephemeral loopback port
    pub async fn create_tunnel(
        &self,
        destination: TunnelDestination,
        policy: RelayPolicy,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        self.create_tunnel_on_port(destination, policy, credentials, 0)
            .await
    }

    /// Create a tunnel listening on `local_port` (0 for an ephemeral port)
    pub async fn create_tunnel_on_port(
        &self,
        destination: TunnelDestination,
        policy: RelayPolicy,
        credentials: Arc<dyn CredentialSource>,
        local_port: u16,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TunnelError::ServiceShutDown);
        }
        if !self.listen_ip.is_loopback() {
            return Err(TunnelError::NonLoopbackListenAddress(self.listen_ip));
        }
        self.config.validate()?;

        let addr = SocketAddr::new(self.listen_ip, local_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;

        let tunnel = Arc::new(Tunnel::start(
            listener,
            TunnelParams {
                destination,
                policy,
                transport: self.transport.clone(),
                credentials,
                resolver: self.resolver.clone(),
                config: self.config.clone(),
            },
        )?);

        self.tunnels
            .write()
            .await
            .insert(tunnel.id(), tunnel.clone());

        Ok(tunnel)
    }

    pub async fn tunnel(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.prune_stopped().await;
        self.tunnels.read().await.get(&id).cloned()
    }

    /// Tunnels that are still accepting callers
    pub async fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.prune_stopped().await;
        self.tunnels.read().await.values().cloned().collect()
    }

    /// Forget tunnels disposed directly or stopped by a listener failure
    async fn prune_stopped(&self) {
        self.tunnels.write().await.retain(|id, tunnel| {
            let running = tunnel.is_running();
            if !running {
                debug!("Forgetting stopped tunnel {}", id);
            }
            running
        });
    }

    /// Dispose a tunnel and forget it; `false` if the id is unknown
    pub async fn close_tunnel(&self, id: TunnelId) -> bool {
        let removed = self.tunnels.write().await.remove(&id);

        match removed {
            Some(tunnel) => {
                tunnel.dispose().await;
                true
            }
            None => {
                debug!("Tunnel {} not found", id);
                false
            }
        }
    }

    /// Probe any destination without creating a tunnel
    pub async fn probe(
        &self,
        destination: TunnelDestination,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        TunnelProbe::new(
            self.transport.clone(),
            destination,
            credentials,
            self.config.clone(),
        )
        .run(timeout)
        .await
    }

    /// Dispose every tunnel and refuse new ones
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let tunnels: Vec<_> = self.tunnels.write().await.drain().map(|(_, t)| t).collect();
        info!("Shutting down {} tunnel(s)", tunnels.len());

        futures::future::join_all(tunnels.iter().map(|tunnel| tunnel.dispose())).await;
    }
}
