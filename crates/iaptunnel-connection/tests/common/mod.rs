//! Scripted relay endpoint for connection tests
//!
//! Tests play the relay side by hand: accept a transport, read the frames the
//! client sends and reply with whatever the scenario needs.

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iaptunnel_connection::{
    CredentialSource, ReconnectConfig, RelayConfig, RelayConnection, RelayCredential,
    StaticCredential,
};
use iaptunnel_proto::{Frame, FrameCodec, InstanceLocator, TunnelDestination};
use iaptunnel_transport::{ClientCertificate, MemoryAcceptor, MemoryConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

/// Upper bound for any single step of a scenario
pub const STEP: Duration = Duration::from_secs(5);

pub const SID: &[u8] = b"sid-1";

pub fn destination(port: u16) -> TunnelDestination {
    TunnelDestination::new(
        InstanceLocator::new("my-project", "us-central1-a", "instance-a"),
        port,
    )
}

pub fn credential(token: &str) -> Arc<dyn CredentialSource> {
    Arc::new(StaticCredential::new(RelayCredential::bearer(token)))
}

/// Short timeouts and a deterministic backoff
pub fn fast_config() -> RelayConfig {
    RelayConfig::default()
        .with_connect_timeout(Duration::from_secs(1))
        .with_ack_interval(Duration::from_millis(50))
        .with_ack_threshold(4096)
        .with_close_timeout(Duration::from_millis(200))
        .with_reconnect(
            ReconnectConfig::default()
                .with_initial_backoff(Duration::from_millis(10))
                .with_max_backoff(Duration::from_millis(40))
                .with_jitter(0.0)
                .with_max_attempts(Some(3)),
        )
}

/// Relay end of one transport connection
pub struct RelaySide {
    pub connection_id: u64,
    pub client_certificate: Option<ClientCertificate>,
    framed: Framed<DuplexStream, FrameCodec>,
}

impl RelaySide {
    pub async fn accept(acceptor: &MemoryAcceptor) -> Self {
        let connection = tokio::time::timeout(STEP, acceptor.accept())
            .await
            .expect("client did not connect")
            .expect("acceptor closed");

        Self {
            connection_id: connection.connection_id,
            client_certificate: connection.client_certificate,
            framed: Framed::new(connection.stream, FrameCodec),
        }
    }

    /// Accept a transport and complete the CONNECT handshake
    pub async fn accept_session(acceptor: &MemoryAcceptor) -> Self {
        let mut relay = Self::accept(acceptor).await;
        relay.expect_connect().await;
        relay
            .send(Frame::ConnectSuccessSid {
                sid: Bytes::from_static(SID),
            })
            .await;
        relay
    }

    /// Next frame, `None` once the client closed the transport
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::time::timeout(STEP, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .map(|frame| frame.expect("client sent an undecodable frame"))
    }

    pub async fn recv(&mut self) -> Frame {
        self.next().await.expect("client closed the transport")
    }

    /// Next frame that is not an ACK
    pub async fn recv_skip_acks(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Frame::Ack { .. } => continue,
                frame => return frame,
            }
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("relay send failed");
    }

    pub async fn send_data(&mut self, seq: u64, payload: &'static [u8]) {
        self.send(Frame::Data {
            seq,
            payload: Bytes::from_static(payload),
        })
        .await;
    }

    /// Read the CONNECT frame, returning the destination and bearer token
    pub async fn expect_connect(&mut self) -> (TunnelDestination, String) {
        match self.recv().await {
            Frame::Connect { destination, token } => (destination, token.as_str().to_string()),
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }
}

pub fn data(seq: u64, payload: &'static [u8]) -> Frame {
    Frame::Data {
        seq,
        payload: Bytes::from_static(payload),
    }
}

/// Open a connection against a relay that accepts the session
pub async fn open_connection(
    connector: &MemoryConnector,
    acceptor: &MemoryAcceptor,
    config: RelayConfig,
) -> (RelayConnection, RelaySide) {
    open_with_credentials(connector, acceptor, config, credential("test-token")).await
}

pub async fn open_with_credentials(
    connector: &MemoryConnector,
    acceptor: &MemoryAcceptor,
    config: RelayConfig,
    credentials: Arc<dyn CredentialSource>,
) -> (RelayConnection, RelaySide) {
    let open = RelayConnection::open(
        Arc::new(connector.clone()),
        destination(3389),
        credentials,
        config,
    );
    let (connection, relay) = tokio::join!(open, RelaySide::accept_session(acceptor));
    (connection.expect("open failed"), relay)
}
