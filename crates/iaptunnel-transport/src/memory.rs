//! In-process transport
//!
//! Connects the client to a relay endpoint running in the same process over
//! `tokio::io::duplex` pipes. Used by the test suites and for embedding a
//! relay; it also counts connect attempts and can simulate an unreachable
//! endpoint.

use crate::{
    BoxedTransportStream, ClientCertificate, TransportConnector, TransportError, TransportResult,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// Server half of an in-process connection
#[derive(Debug)]
pub struct MemoryConnection {
    /// Connection number, starting at 1
    pub connection_id: u64,

    /// Byte stream to the client
    pub stream: DuplexStream,

    /// Certificate the client presented during setup
    pub client_certificate: Option<ClientCertificate>,
}

#[derive(Debug)]
struct Shared {
    incoming_tx: mpsc::UnboundedSender<MemoryConnection>,
    attempts: AtomicU64,
    offline: AtomicBool,
    pipe_capacity: usize,
}

/// Client side of the in-process transport
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

/// Relay side of the in-process transport
#[derive(Debug)]
pub struct MemoryAcceptor {
    incoming_rx: Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

/// Create a connected connector/acceptor pair
pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    memory_transport_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Create a pair whose pipes buffer at most `pipe_capacity` bytes per direction
pub fn memory_transport_with_capacity(pipe_capacity: usize) -> (MemoryConnector, MemoryAcceptor) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

    let connector = MemoryConnector {
        shared: Arc::new(Shared {
            incoming_tx,
            attempts: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            pipe_capacity,
        }),
    };

    let acceptor = MemoryAcceptor {
        incoming_rx: Mutex::new(incoming_rx),
    };

    (connector, acceptor)
}

impl MemoryConnector {
    /// Number of connect attempts made so far, successful or not
    pub fn connect_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent connect attempts fail as if the endpoint were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(
        &self,
        client_cert: Option<&ClientCertificate>,
    ) -> TransportResult<BoxedTransportStream> {
        let connection_id = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "Relay endpoint unreachable".to_string(),
            ));
        }

        let (client, server) = tokio::io::duplex(self.shared.pipe_capacity);

        self.shared
            .incoming_tx
            .send(MemoryConnection {
                connection_id,
                stream: server,
                client_certificate: client_cert.cloned(),
            })
            .map_err(|_| TransportError::ConnectionError("Connection refused".to_string()))?;

        debug!("Memory transport connection {} established", connection_id);

        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "memory://relay".to_string()
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

impl MemoryAcceptor {
    /// Accept the next incoming connection
    ///
    /// Returns `None` once every connector has been dropped.
    pub async fn accept(&self) -> Option<MemoryConnection> {
        self.incoming_rx.lock().await.recv().await
    }
}
