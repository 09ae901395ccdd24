//! Loopback tunnels
//!
//! A [`Tunnel`] listens on a loopback port. Every accepted caller is checked
//! against the tunnel's [`RelayPolicy`]; allowed callers get their own
//! [`RelayConnection`] to the tunnel's destination and bytes are pumped in
//! both directions until either side ends.

use async_trait::async_trait;
use bytes::Bytes;
use iaptunnel_connection::{
    CredentialSource, RelayConfig, RelayConnection, RelayError, RelayReader, RelayWriter,
    TunnelProbe, AUDIT_TARGET,
};
use iaptunnel_proto::TunnelDestination;
use iaptunnel_transport::{
    BoxedTransportStream, ClientCertificate, TransportConnector, TransportResult,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::peer::{LocalPeer, PeerResolver};
use crate::policy::RelayPolicy;

pub type TunnelId = Uuid;

/// Read buffer for the local-to-relay pump
const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

const EVENT_CAPACITY: usize = 64;

/// Something that happened on a tunnel
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A local caller passed the policy check
    Accepted { peer: LocalPeer },

    /// A local caller was refused by the relay policy; no relay traffic occurred
    RejectedByPolicy { peer: LocalPeer },

    /// The relay connection for an accepted caller could not be opened
    ConnectionFailed { peer: SocketAddr, error: RelayError },

    /// A bridged connection ended, with the relay error that ended it if any
    ConnectionClosed {
        peer: SocketAddr,
        error: Option<RelayError>,
    },

    /// The listener failed; the tunnel no longer accepts callers
    TunnelFailed { reason: String },
}

impl TunnelEvent {
    /// The relay error carried by this event, if any
    pub fn error(&self) -> Option<RelayError> {
        match self {
            TunnelEvent::RejectedByPolicy { .. } => Some(RelayError::RelayPolicyViolation),
            TunnelEvent::ConnectionFailed { error, .. } => Some(error.clone()),
            TunnelEvent::ConnectionClosed { error, .. } => error.clone(),
            TunnelEvent::Accepted { .. } | TunnelEvent::TunnelFailed { .. } => None,
        }
    }
}

/// Records whether any relay transport was set up with a client certificate
#[derive(Debug)]
struct ObservedConnector {
    inner: Arc<dyn TransportConnector>,
    mutual_tls: Arc<AtomicBool>,
}

#[async_trait]
impl TransportConnector for ObservedConnector {
    async fn connect(
        &self,
        client_cert: Option<&ClientCertificate>,
    ) -> TransportResult<BoxedTransportStream> {
        let stream = self.inner.connect(client_cert).await?;
        if client_cert.is_some() {
            self.mutual_tls.store(true, Ordering::SeqCst);
        }
        Ok(stream)
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }
}

/// State shared between the tunnel and its tasks
#[derive(Debug)]
struct TunnelContext {
    id: TunnelId,
    destination: TunnelDestination,
    policy: RelayPolicy,
    local_addr: SocketAddr,
    transport: Arc<dyn TransportConnector>,
    credentials: Arc<dyn CredentialSource>,
    resolver: Arc<dyn PeerResolver>,
    config: RelayConfig,
    events: broadcast::Sender<TunnelEvent>,
    active: AtomicUsize,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TunnelContext {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// A loopback listener bridging local callers to one destination
#[derive(Debug)]
pub struct Tunnel {
    ctx: Arc<TunnelContext>,
    mutual_tls: Arc<AtomicBool>,
    disposed: AtomicBool,
}

pub(crate) struct TunnelParams {
    pub destination: TunnelDestination,
    pub policy: RelayPolicy,
    pub transport: Arc<dyn TransportConnector>,
    pub credentials: Arc<dyn CredentialSource>,
    pub resolver: Arc<dyn PeerResolver>,
    pub config: RelayConfig,
}

impl Tunnel {
    /// Start accepting callers on an already bound loopback listener
    pub(crate) fn start(listener: TcpListener, params: TunnelParams) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let mutual_tls = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let ctx = Arc::new(TunnelContext {
            id: Uuid::new_v4(),
            destination: params.destination,
            policy: params.policy,
            local_addr,
            transport: Arc::new(ObservedConnector {
                inner: params.transport,
                mutual_tls: mutual_tls.clone(),
            }),
            credentials: params.credentials,
            resolver: params.resolver,
            config: params.config,
            events,
            active: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        info!(
            target: AUDIT_TARGET,
            tunnel_id = %ctx.id,
            destination = %ctx.destination,
            local_addr = %local_addr,
            policy = %ctx.policy,
            "Tunnel started"
        );

        ctx.tasks.spawn(accept_loop(ctx.clone(), listener));

        Ok(Self {
            ctx,
            mutual_tls,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TunnelId {
        self.ctx.id
    }

    pub fn destination(&self) -> &TunnelDestination {
        &self.ctx.destination
    }

    pub fn policy(&self) -> RelayPolicy {
        self.ctx.policy
    }

    /// Loopback address callers connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr
    }

    /// Whether any relay connection of this tunnel used a client certificate
    pub fn is_mutual_tls_enabled(&self) -> bool {
        self.mutual_tls.load(Ordering::SeqCst)
    }

    /// Number of callers currently bridged to the relay
    pub fn active_connections(&self) -> usize {
        self.ctx.active.load(Ordering::SeqCst)
    }

    /// Whether the tunnel still accepts callers
    pub fn is_running(&self) -> bool {
        !self.ctx.cancel.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.ctx.events.subscribe()
    }

    /// Handshake with the relay for this tunnel's destination and close again
    pub async fn probe(&self, timeout: Duration) -> Result<(), RelayError> {
        if self.is_disposed() {
            return Err(RelayError::Closed);
        }

        TunnelProbe::new(
            self.ctx.transport.clone(),
            self.ctx.destination.clone(),
            self.ctx.credentials.clone(),
            self.ctx.config.clone(),
        )
        .run(timeout)
        .await
    }

    /// Stop listening and close every bridged connection
    ///
    /// Idempotent. Returns once the listener is released and all relay
    /// connections of this tunnel have closed.
    pub async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            info!(
                target: AUDIT_TARGET,
                tunnel_id = %self.ctx.id,
                destination = %self.ctx.destination,
                active_connections = self.active_connections(),
                "Disposing tunnel"
            );
            self.ctx.cancel.cancel();
            self.ctx.tasks.close();
        }

        self.ctx.tasks.wait().await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}

async fn accept_loop(ctx: Arc<TunnelContext>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(tunnel_id = %ctx.id, "Tunnel listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(tunnel_id = %ctx.id, "Accepted local connection from {}", peer_addr);
                    ctx.tasks.spawn(handle_local_connection(ctx.clone(), stream, peer_addr));
                }
                Err(e) => {
                    error!(
                        target: AUDIT_TARGET,
                        tunnel_id = %ctx.id,
                        destination = %ctx.destination,
                        error = %e,
                        "Tunnel listener failed"
                    );
                    ctx.emit(TunnelEvent::TunnelFailed { reason: e.to_string() });
                    ctx.cancel.cancel();
                    break;
                }
            }
        }
    }
}

/// Decrements the active connection count when a bridge ends
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_local_connection(ctx: Arc<TunnelContext>, stream: TcpStream, peer_addr: SocketAddr) {
    let peer = if ctx.policy.requires_identity() {
        ctx.resolver.resolve(peer_addr, ctx.local_addr).await
    } else {
        LocalPeer::new(peer_addr)
    };

    if !ctx.policy.evaluate(&peer).is_allowed() {
        warn!(
            target: AUDIT_TARGET,
            tunnel_id = %ctx.id,
            destination = %ctx.destination,
            peer = %peer_addr,
            pid = ?peer.pid,
            uid = ?peer.uid,
            policy = %ctx.policy,
            "Local connection rejected by relay policy"
        );
        drop(stream);
        ctx.emit(TunnelEvent::RejectedByPolicy { peer });
        return;
    }

    ctx.emit(TunnelEvent::Accepted { peer: peer.clone() });

    let connection = match RelayConnection::open_with_cancel(
        ctx.transport.clone(),
        ctx.destination.clone(),
        ctx.credentials.clone(),
        ctx.config.clone(),
        ctx.cancel.child_token(),
    )
    .await
    {
        Ok(connection) => connection,
        Err(error) => {
            warn!(
                tunnel_id = %ctx.id,
                peer = %peer_addr,
                "Failed to open relay connection: {}",
                error
            );
            ctx.emit(TunnelEvent::ConnectionFailed {
                peer: peer_addr,
                error,
            });
            return;
        }
    };

    let result = {
        let _active = ActiveGuard::enter(&ctx.active);
        bridge(stream, connection, ctx.cancel.child_token()).await
    };

    match &result {
        Ok(()) => debug!(tunnel_id = %ctx.id, peer = %peer_addr, "Local connection closed"),
        Err(e) => warn!(tunnel_id = %ctx.id, peer = %peer_addr, "Local connection ended: {}", e),
    }

    ctx.emit(TunnelEvent::ConnectionClosed {
        peer: peer_addr,
        error: result.err(),
    });
}

/// Pump bytes both ways; when either side ends, close both
///
/// Cancelling `cancel` drops the local socket even if a pump is blocked on it.
async fn bridge(
    stream: TcpStream,
    connection: RelayConnection,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let handle = connection.handle().clone();
    let (mut writer, mut reader) = connection.split();
    let (mut local_read, mut local_write) = stream.into_split();

    let result = tokio::select! {
        result = local_to_relay(&mut local_read, &mut writer) => result,
        result = relay_to_local(&mut reader, &mut local_write) => result,
        _ = cancel.cancelled() => Ok(()),
    };

    handle.close().await;

    // A relay fault that raced a local close still ends the connection in error
    match (result, handle.fault()) {
        (Err(e), _) => Err(e),
        (Ok(()), Some(fault)) => Err(fault),
        (Ok(()), None) => Ok(()),
    }
}

async fn local_to_relay(
    local_read: &mut OwnedReadHalf,
    writer: &mut RelayWriter,
) -> Result<(), RelayError> {
    let mut buffer = vec![0u8; BRIDGE_BUFFER_SIZE];
    loop {
        match local_read.read(&mut buffer).await {
            Ok(0) => return Ok(()),
            Ok(n) => writer.send(Bytes::copy_from_slice(&buffer[..n])).await?,
            Err(e) => {
                debug!("Local read failed: {}", e);
                return Ok(());
            }
        }
    }
}

async fn relay_to_local(
    reader: &mut RelayReader,
    local_write: &mut OwnedWriteHalf,
) -> Result<(), RelayError> {
    while let Some(chunk) = reader.recv().await? {
        if let Err(e) = local_write.write_all(&chunk).await {
            debug!("Local write failed: {}", e);
            return Ok(());
        }
    }

    let _ = local_write.shutdown().await;
    Ok(())
}
