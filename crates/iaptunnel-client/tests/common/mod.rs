//! In-process relay for tunnel tests
//!
//! Serves every transport accepted from a [`MemoryAcceptor`]: completes the
//! CONNECT handshake (or refuses it), then echoes DATA back to the client and
//! acknowledges what it received. With [`FakeRelay::with_resume`] sessions
//! outlive their transport and RESUME picks them up again.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iaptunnel_client::{
    CredentialSource, LocalPeer, PeerResolver, RelayConfig, RelayCredential, StaticCredential,
    TunnelEvent,
};
use iaptunnel_connection::ReconnectConfig;
use iaptunnel_proto::{CloseCode, Frame, FrameCodec, InstanceLocator, TunnelDestination};
use iaptunnel_transport::{ClientCertificate, MemoryAcceptor, MemoryConnection};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Echo,
    Refuse(CloseCode),
}

#[derive(Debug)]
struct RelayState {
    behavior: Mutex<Behavior>,
    kill: Mutex<CancellationToken>,
    destinations: Mutex<Vec<TunnelDestination>>,
    certificates: Mutex<Vec<Option<ClientCertificate>>>,
    frames: AtomicUsize,
    sessions: AtomicUsize,
    resumable: AtomicBool,
    resumes: AtomicUsize,
    live: Mutex<HashMap<Bytes, Arc<tokio::sync::Mutex<Session>>>>,
}

/// Relay side of one session
#[derive(Debug, Default)]
struct Session {
    /// Contiguous bytes received from the client
    received: u64,
    /// End offset of the last echoed DATA frame
    sent: u64,
    /// Echoed bytes the client has not acknowledged, as (end offset, payload)
    unacked: VecDeque<(u64, Bytes)>,
}

impl Session {
    /// Record a client DATA frame; returns the bytes not seen before
    fn accept(&mut self, seq: u64, payload: Bytes) -> Option<Bytes> {
        let start = seq - payload.len() as u64;
        if seq <= self.received || start > self.received {
            return None;
        }
        let fresh = payload.slice((self.received - start) as usize..);
        self.received = seq;
        Some(fresh)
    }

    fn echo(&mut self, payload: Bytes) -> Frame {
        self.sent += payload.len() as u64;
        self.unacked.push_back((self.sent, payload.clone()));
        Frame::Data {
            seq: self.sent,
            payload,
        }
    }

    fn trim(&mut self, ack: u64) {
        while let Some((end, payload)) = self.unacked.front_mut() {
            if *end <= ack {
                self.unacked.pop_front();
                continue;
            }
            let start = *end - payload.len() as u64;
            if start < ack {
                *payload = payload.slice((ack - start) as usize..);
            }
            break;
        }
    }
}

/// Relay endpoint running in a background task
pub struct FakeRelay {
    state: Arc<RelayState>,
}

impl FakeRelay {
    pub fn start(acceptor: MemoryAcceptor, behavior: Behavior) -> Self {
        let state = Arc::new(RelayState {
            behavior: Mutex::new(behavior),
            kill: Mutex::new(CancellationToken::new()),
            destinations: Mutex::new(Vec::new()),
            certificates: Mutex::new(Vec::new()),
            frames: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            resumable: AtomicBool::new(false),
            resumes: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
        });

        let relay_state = state.clone();
        tokio::spawn(async move {
            while let Some(connection) = acceptor.accept().await {
                tokio::spawn(serve(relay_state.clone(), connection));
            }
        });

        Self { state }
    }

    /// Keep sessions across dropped transports and honor RESUME
    pub fn with_resume(self) -> Self {
        self.state.resumable.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    /// Abort every transport currently being served
    pub fn drop_connections(&self) {
        let mut kill = self.state.kill.lock().unwrap();
        kill.cancel();
        *kill = CancellationToken::new();
    }

    pub fn destinations(&self) -> Vec<TunnelDestination> {
        self.state.destinations.lock().unwrap().clone()
    }

    pub fn certificates(&self) -> Vec<Option<ClientCertificate>> {
        self.state.certificates.lock().unwrap().clone()
    }

    /// Frames received from clients, across all transports
    pub fn frames_received(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }

    /// Sessions the relay accepted
    pub fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// RESUME handshakes the relay accepted
    pub fn resumes(&self) -> usize {
        self.state.resumes.load(Ordering::SeqCst)
    }
}

async fn serve(state: Arc<RelayState>, connection: MemoryConnection) {
    let kill = state.kill.lock().unwrap().clone();
    state
        .certificates
        .lock()
        .unwrap()
        .push(connection.client_certificate.clone());

    let mut framed = Framed::new(connection.stream, FrameCodec);

    let Some(Ok(first)) = framed.next().await else {
        return;
    };
    state.frames.fetch_add(1, Ordering::SeqCst);

    let session = match first {
        Frame::Connect { destination, .. } => {
            state.destinations.lock().unwrap().push(destination);
            let behavior = *state.behavior.lock().unwrap();
            match behavior {
                Behavior::Refuse(code) => {
                    let _ = framed
                        .send(Frame::ConnectFail {
                            code,
                            reason: "refused by test relay".to_string(),
                        })
                        .await;
                    return;
                }
                Behavior::Echo => {
                    let n = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;
                    let sid = Bytes::from(format!("sid-{}", n));
                    let session = Arc::new(tokio::sync::Mutex::new(Session::default()));
                    state
                        .live
                        .lock()
                        .unwrap()
                        .insert(sid.clone(), session.clone());
                    if framed.send(Frame::ConnectSuccessSid { sid }).await.is_err() {
                        return;
                    }
                    session
                }
            }
        }
        Frame::Resume { sid, received } if state.resumable.load(Ordering::SeqCst) => {
            let known = state.live.lock().unwrap().get(&sid).cloned();
            let Some(session) = known else {
                let _ = framed
                    .send(Frame::ConnectFail {
                        code: CloseCode::SID_UNKNOWN,
                        reason: "unknown session".to_string(),
                    })
                    .await;
                return;
            };

            // Waits for the transport that served the session before to let go
            let mut guard = session.clone().lock_owned().await;
            guard.trim(received);
            let mut frames = vec![Frame::ResumeSuccessAck {
                ack: guard.received,
            }];
            frames.extend(guard.unacked.iter().map(|(end, payload)| Frame::Data {
                seq: *end,
                payload: payload.clone(),
            }));
            drop(guard);

            state.resumes.fetch_add(1, Ordering::SeqCst);
            for frame in frames {
                if framed.send(frame).await.is_err() {
                    return;
                }
            }
            session
        }
        // Sessions do not survive a dropped transport here
        _ => {
            let _ = framed
                .send(Frame::ConnectFail {
                    code: CloseCode::SID_UNKNOWN,
                    reason: "unknown session".to_string(),
                })
                .await;
            return;
        }
    };

    let mut session = session.lock_owned().await;
    loop {
        tokio::select! {
            _ = kill.cancelled() => return,
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { return };
                state.frames.fetch_add(1, Ordering::SeqCst);

                match frame {
                    Frame::Data { seq, payload } => {
                        let Some(fresh) = session.accept(seq, payload) else {
                            continue;
                        };
                        let ack = Frame::Ack { ack: session.received };
                        let echo = session.echo(fresh);
                        let sent = tokio::select! {
                            _ = kill.cancelled() => return,
                            sent = async {
                                framed.send(ack).await?;
                                framed.send(echo).await
                            } => sent,
                        };
                        if sent.is_err() {
                            return;
                        }
                    }
                    Frame::Ack { ack } => session.trim(ack),
                    Frame::Close { .. } => return,
                    _ => {}
                }
            }
        }
    }
}

/// Resolver that attributes every caller to a fixed process and user
#[derive(Debug, Clone, Copy)]
pub struct FixedPeerResolver {
    pub pid: u32,
    pub uid: u32,
}

#[async_trait]
impl PeerResolver for FixedPeerResolver {
    async fn resolve(&self, peer: SocketAddr, _local: SocketAddr) -> LocalPeer {
        LocalPeer::new(peer).with_pid(self.pid).with_uid(self.uid)
    }
}

pub fn destination(name: &str, port: u16) -> TunnelDestination {
    TunnelDestination::new(
        InstanceLocator::new("my-project", "us-central1-a", name),
        port,
    )
}

pub fn credential(token: &str) -> Arc<dyn CredentialSource> {
    Arc::new(StaticCredential::new(RelayCredential::bearer(token)))
}

pub fn fast_config() -> RelayConfig {
    RelayConfig::default()
        .with_connect_timeout(Duration::from_secs(1))
        .with_ack_interval(Duration::from_millis(50))
        .with_close_timeout(Duration::from_millis(200))
        .with_reconnect(
            ReconnectConfig::default()
                .with_initial_backoff(Duration::from_millis(10))
                .with_max_backoff(Duration::from_millis(40))
                .with_jitter(0.0)
                .with_max_attempts(Some(3)),
        )
}

/// Wait for the next event matching `pred`
pub async fn next_event(
    events: &mut broadcast::Receiver<TunnelEvent>,
    pred: impl Fn(&TunnelEvent) -> bool,
) -> TunnelEvent {
    tokio::time::timeout(STEP, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("tunnel event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for tunnel event")
}
