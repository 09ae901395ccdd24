//! Relay connection: handshake, sequencing, retransmission and resume
//!
//! Each connection is driven by one task that owns the transport, the
//! sequence counters and the retransmit buffer. Callers talk to it through a
//! [`RelayWriter`] (bytes in) and a [`RelayReader`] (bytes out):
//!
//! ```text
//!  RelayWriter ──permits──▶ budget (Semaphore, C bytes)
//!      │                        ▲ add_permits on ACK
//!      └──mpsc──▶ driver ───────┘
//!                  │  ▲
//!        DATA/ACK  │  │ DATA/ACK/CLOSE
//!                  ▼  │
//!               transport ◀── resumed in place after loss
//!                  │
//!  RelayReader ◀──mpsc── (pending queue, never blocks ACK processing)
//! ```
//!
//! Outbound sequence numbers are cumulative byte offsets. The retransmit
//! buffer holds exactly the bytes in `(acked, sent]`; a writer suspends once
//! `C` bytes are outstanding.

use bytes::Bytes;
use futures::future::poll_fn;
use futures::{SinkExt, Stream, StreamExt};
use iaptunnel_proto::{CloseCode, CodecError, Frame, FrameCodec, TunnelDestination};
use iaptunnel_transport::{BoxedTransportStream, TransportConnector};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::credential::CredentialSource;
use crate::error::RelayError;
use crate::reconnect::Reconnector;
use crate::AUDIT_TARGET;

type RelayFramed = Framed<BoxedTransportStream, FrameCodec>;

/// Chunks queued between the writer and the driver
const OUTBOUND_QUEUE: usize = 64;

/// Chunks queued between the driver and the reader
const INBOUND_QUEUE: usize = 32;

/// Lifecycle of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Reconnecting,
    Closed,
    Faulted,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Shared {
    destination: TunnelDestination,
    sid: Bytes,
    /// Printable SID for logs
    sid_label: String,
    mutual_tls: AtomicBool,
    state: watch::Sender<ConnectionState>,
    fault: OnceLock<RelayError>,
    /// Free space in the retransmit buffer, in bytes
    budget: Semaphore,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn terminal_error(&self) -> RelayError {
        self.fault.get().cloned().unwrap_or(RelayError::Closed)
    }
}

/// Cloneable handle for observing and closing a connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn destination(&self) -> &TunnelDestination {
        &self.shared.destination
    }

    /// Session id assigned by the relay
    pub fn sid(&self) -> &Bytes {
        &self.shared.sid
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the current transport presented a client certificate
    pub fn is_mutual_tls(&self) -> bool {
        self.shared.mutual_tls.load(Ordering::SeqCst)
    }

    /// The error that faulted the connection, if any
    pub fn fault(&self) -> Option<RelayError> {
        self.shared.fault.get().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the connection is closed or faulted
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Flush queued sends, send CLOSE and tear down the transport
    ///
    /// Idempotent; returns once the driver has finished.
    pub async fn close(&self) {
        if !self.state().is_terminal() {
            debug!(
                destination = %self.shared.destination,
                sid = %self.shared.sid_label,
                "Closing relay connection"
            );
        }
        self.shared.cancel.cancel();
        self.closed().await;
    }
}

/// Sending half of a relay connection
#[derive(Debug)]
pub struct RelayWriter {
    handle: ConnectionHandle,
    outbound: mpsc::Sender<Bytes>,
    max_chunk: usize,
}

impl RelayWriter {
    /// Send bytes, suspending while the retransmit buffer is full
    ///
    /// Fails with the connection's fault, or `Closed`, once the connection
    /// has ended.
    pub async fn send(&mut self, data: impl Into<Bytes>) -> Result<(), RelayError> {
        let mut data: Bytes = data.into();
        let shared = &self.handle.shared;

        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(self.max_chunk));
            // Chunks never exceed MAX_DATA_FRAME_SIZE
            let permits = chunk.len() as u32;

            let permit = tokio::select! {
                _ = shared.cancel.cancelled() => return Err(shared.terminal_error()),
                permit = shared.budget.acquire_many(permits) => permit,
            };
            match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(shared.terminal_error()),
            }

            if self.outbound.send(chunk).await.is_err() {
                return Err(shared.terminal_error());
            }
        }

        Ok(())
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub async fn close(&self) {
        self.handle.close().await
    }
}

/// Receiving half of a relay connection
///
/// Yields in-order chunks. After the relay closes normally the stream ends;
/// after a fault it yields the fault once.
#[derive(Debug)]
pub struct RelayReader {
    handle: ConnectionHandle,
    inbound: mpsc::Receiver<Bytes>,
    done: bool,
}

impl RelayReader {
    /// Next chunk, `Ok(None)` at end of stream
    pub async fn recv(&mut self) -> Result<Option<Bytes>, RelayError> {
        match self.inbound.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None => match self.handle.fault() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Stream for RelayReader {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.inbound.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(this.handle.fault().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A reliable, resumable byte stream to a destination through the relay
#[derive(Debug)]
pub struct RelayConnection {
    writer: RelayWriter,
    reader: RelayReader,
}

impl RelayConnection {
    /// Connect, authenticate and start the connection driver
    pub async fn open(
        transport: Arc<dyn TransportConnector>,
        destination: TunnelDestination,
        credentials: Arc<dyn CredentialSource>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        Self::open_with_cancel(
            transport,
            destination,
            credentials,
            config,
            CancellationToken::new(),
        )
        .await
    }

    /// Like [`open`](Self::open); cancelling `cancel` aborts the handshake
    /// or, later, closes the connection
    pub async fn open_with_cancel(
        transport: Arc<dyn TransportConnector>,
        destination: TunnelDestination,
        credentials: Arc<dyn CredentialSource>,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let (state, _) = watch::channel(ConnectionState::Connecting);

        debug!(
            destination = %destination,
            "Opening relay connection via {}",
            transport.endpoint()
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Closed),
            result = tokio::time::timeout(
                config.connect_timeout,
                handshake(transport.as_ref(), credentials.as_ref(), &destination),
            ) => result.unwrap_or(Err(RelayError::Timeout)),
        };

        let (framed, sid, mutual_tls) = match outcome {
            Ok(established) => established,
            Err(err) => {
                warn!(
                    target: AUDIT_TARGET,
                    destination = %destination,
                    error = %err,
                    "Relay connection failed"
                );
                return Err(err);
            }
        };

        let sid_label = String::from_utf8_lossy(&sid).into_owned();
        info!(
            target: AUDIT_TARGET,
            destination = %destination,
            sid = %sid_label,
            mutual_tls,
            "Relay connection opened"
        );

        state.send_replace(ConnectionState::Established);

        let shared = Arc::new(Shared {
            destination,
            sid,
            sid_label,
            mutual_tls: AtomicBool::new(mutual_tls),
            state,
            fault: OnceLock::new(),
            budget: Semaphore::new(config.retransmit_buffer_capacity),
            cancel,
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let handle = ConnectionHandle {
            shared: shared.clone(),
        };
        let max_chunk = config.max_data_frame_size;

        let driver = Driver {
            shared,
            transport,
            credentials,
            reconnector: Reconnector::new(config.reconnect.clone()),
            config,
            outbound: outbound_rx,
            outbound_open: true,
            inbound: Some(inbound_tx),
            sent: 0,
            written: 0,
            acked: 0,
            unacked: VecDeque::new(),
            received: 0,
            delivered: 0,
            last_ack_sent: 0,
            pending: VecDeque::new(),
        };
        tokio::spawn(driver.run(framed));

        Ok(Self {
            writer: RelayWriter {
                handle: handle.clone(),
                outbound: outbound_tx,
                max_chunk,
            },
            reader: RelayReader {
                handle,
                inbound: inbound_rx,
                done: false,
            },
        })
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.writer.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.writer.handle.state()
    }

    pub fn is_mutual_tls(&self) -> bool {
        self.writer.handle.is_mutual_tls()
    }

    pub async fn send(&mut self, data: impl Into<Bytes>) -> Result<(), RelayError> {
        self.writer.send(data).await
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, RelayError> {
        self.reader.recv().await
    }

    pub async fn close(&self) {
        self.writer.handle.close().await
    }

    /// Split into independently owned halves
    ///
    /// Dropping both halves closes the connection.
    pub fn split(self) -> (RelayWriter, RelayReader) {
        (self.writer, self.reader)
    }
}

/// Connect the transport and perform the CONNECT handshake
async fn handshake(
    transport: &dyn TransportConnector,
    credentials: &dyn CredentialSource,
    destination: &TunnelDestination,
) -> Result<(RelayFramed, Bytes, bool), RelayError> {
    let credential = credentials.credential().await?;
    let mutual_tls = credential.client_certificate.is_some();

    let stream = transport
        .connect(credential.client_certificate.as_ref())
        .await?;
    let mut framed = Framed::new(stream, FrameCodec);

    framed
        .send(Frame::Connect {
            destination: destination.clone(),
            token: credential.token,
        })
        .await?;

    match framed.next().await {
        Some(Ok(Frame::ConnectSuccessSid { sid })) => Ok((framed, sid, mutual_tls)),
        Some(Ok(Frame::ConnectFail { code, reason })) => {
            Err(RelayError::Unauthorized { code, reason })
        }
        Some(Ok(Frame::Close { code, reason })) => Err(RelayError::from_close(code, reason)),
        Some(Ok(other)) => Err(RelayError::ProtocolViolation(format!(
            "expected CONNECT_SUCCESS_SID, got {:?}",
            other.tag()
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(RelayError::TransportFault(
            "relay closed the transport during handshake".to_string(),
        )),
    }
}

/// Why the pump loop stopped
enum Interrupt {
    /// Local close or dispose
    Cancelled,
    /// Both halves were dropped
    Abandoned,
    TransportLost(RelayError),
    Fault(RelayError),
    RemoteClose { code: CloseCode, reason: String },
}

impl From<CodecError> for Interrupt {
    fn from(err: CodecError) -> Self {
        match RelayError::from(err) {
            err @ RelayError::TransportFault(_) => Interrupt::TransportLost(err),
            err => Interrupt::Fault(err),
        }
    }
}

enum Event {
    Cancelled,
    Deliverable(Option<mpsc::OwnedPermit<Bytes>>),
    Frame(Option<Result<Frame, CodecError>>),
    Outbound(Option<Bytes>),
    AckTick,
}

async fn reserve(inbound: Option<mpsc::Sender<Bytes>>) -> Option<mpsc::OwnedPermit<Bytes>> {
    inbound?.reserve_owned().await.ok()
}

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn TransportConnector>,
    credentials: Arc<dyn CredentialSource>,
    config: RelayConfig,
    reconnector: Reconnector,

    outbound: mpsc::Receiver<Bytes>,
    outbound_open: bool,
    /// `None` once the reader has gone away
    inbound: Option<mpsc::Sender<Bytes>>,

    /// End offset of the last DATA frame sent
    sent: u64,
    /// End offset of the last DATA frame handed to the transport
    written: u64,
    /// Highest ACK from the relay
    acked: u64,
    /// Retransmit buffer as (end offset, payload)
    unacked: VecDeque<(u64, Bytes)>,

    /// Contiguous bytes received from the relay
    received: u64,
    /// Bytes handed to the reader; ACKs never exceed this
    delivered: u64,
    last_ack_sent: u64,
    /// Received but not yet handed to the reader
    pending: VecDeque<Bytes>,
}

impl Driver {
    async fn run(mut self, mut framed: RelayFramed) {
        loop {
            match self.pump(&mut framed).await {
                Interrupt::Cancelled | Interrupt::Abandoned => {
                    self.shutdown(&mut framed).await;
                    self.finish(None);
                    return;
                }
                Interrupt::RemoteClose { code, reason } => {
                    if code.is_normal() {
                        debug!(sid = %self.shared.sid_label, "Relay closed the session");
                        self.drain_pending().await;
                        self.finish(None);
                    } else {
                        self.finish(Some(RelayError::from_close(code, reason)));
                    }
                    return;
                }
                Interrupt::Fault(err) => {
                    self.send_close(&mut framed, err.close_code(), err.to_string())
                        .await;
                    self.finish(Some(err));
                    return;
                }
                Interrupt::TransportLost(err) => {
                    if !self.consumer_present() {
                        debug!(
                            sid = %self.shared.sid_label,
                            "Transport lost with no local reader, not resuming"
                        );
                        self.finish(Some(err));
                        return;
                    }

                    warn!(
                        destination = %self.shared.destination,
                        sid = %self.shared.sid_label,
                        error = %err,
                        "Relay transport lost"
                    );

                    match self.reconnect().await {
                        Ok(resumed) => framed = resumed,
                        Err(None) => {
                            self.finish(None);
                            return;
                        }
                        Err(Some(err)) => {
                            self.finish(Some(err));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Move bytes until something interrupts the session
    async fn pump(&mut self, framed: &mut RelayFramed) -> Interrupt {
        let period = self.config.ack_interval;
        let mut ack_timer = interval_at(Instant::now() + period, period);
        ack_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let has_pending = !self.pending.is_empty();

            let event = tokio::select! {
                _ = self.shared.cancel.cancelled() => Event::Cancelled,
                permit = reserve(self.inbound.clone()), if has_pending => Event::Deliverable(permit),
                frame = framed.next() => Event::Frame(frame),
                chunk = self.outbound.recv(), if self.outbound_open => Event::Outbound(chunk),
                _ = ack_timer.tick() => Event::AckTick,
            };

            let result = match event {
                Event::Cancelled => return Interrupt::Cancelled,
                Event::Deliverable(Some(permit)) => {
                    if let Some(chunk) = self.pending.pop_front() {
                        self.delivered += chunk.len() as u64;
                        permit.send(chunk);
                    }
                    self.ack_if_over_threshold(framed).await
                }
                Event::Deliverable(None) => {
                    self.abandon_reader();
                    if !self.outbound_open {
                        return Interrupt::Abandoned;
                    }
                    self.ack_if_over_threshold(framed).await
                }
                Event::Frame(Some(Ok(frame))) => self.on_frame(framed, frame).await,
                Event::Frame(Some(Err(err))) => Err(Interrupt::from(err)),
                Event::Frame(None) => Err(Interrupt::TransportLost(RelayError::TransportFault(
                    "relay transport closed".to_string(),
                ))),
                Event::Outbound(Some(chunk)) => self.on_outbound(framed, chunk).await,
                Event::Outbound(None) => {
                    self.outbound_open = false;
                    if !self.consumer_present() {
                        return Interrupt::Abandoned;
                    }
                    Ok(())
                }
                Event::AckTick => self.send_ack(framed).await,
            };

            if let Err(interrupt) = result {
                return interrupt;
            }
        }
    }

    async fn on_frame(&mut self, framed: &mut RelayFramed, frame: Frame) -> Result<(), Interrupt> {
        match frame {
            Frame::Data { seq, payload } => {
                self.on_data(seq, payload).map_err(Interrupt::Fault)?;
                self.ack_if_over_threshold(framed).await
            }
            Frame::Ack { ack } => self.on_ack(ack).map_err(Interrupt::Fault),
            Frame::Close { code, reason } | Frame::ConnectFail { code, reason } => {
                Err(Interrupt::RemoteClose { code, reason })
            }
            other => Err(Interrupt::Fault(RelayError::ProtocolViolation(format!(
                "unexpected {:?} frame on an established session",
                other.tag()
            )))),
        }
    }

    fn on_data(&mut self, seq: u64, payload: Bytes) -> Result<(), RelayError> {
        let len = payload.len() as u64;
        let start = seq.checked_sub(len).ok_or_else(|| {
            RelayError::ProtocolViolation(format!(
                "DATA seq {} is smaller than its {} byte payload",
                seq, len
            ))
        })?;

        if seq <= self.received {
            trace!("Dropping duplicate DATA ending at {}", seq);
            return Ok(());
        }
        if start > self.received {
            return Err(RelayError::ProtocolViolation(format!(
                "DATA gap: expected offset {}, got {}",
                self.received, start
            )));
        }

        let fresh = payload.slice((self.received - start) as usize..);
        self.received = seq;

        if self.inbound.is_some() {
            self.pending.push_back(fresh);
        } else {
            self.delivered = self.received;
        }
        Ok(())
    }

    fn on_ack(&mut self, ack: u64) -> Result<(), RelayError> {
        if ack > self.sent {
            return Err(RelayError::ProtocolViolation(format!(
                "ACK {} beyond sent offset {}",
                ack, self.sent
            )));
        }
        if ack > self.acked {
            self.trim(ack);
        }
        Ok(())
    }

    /// Drop acknowledged bytes from the retransmit buffer and free their budget
    fn trim(&mut self, ack: u64) {
        let mut freed = 0u64;

        while let Some(front) = self.unacked.front() {
            let (end, len) = (front.0, front.1.len() as u64);
            if end <= ack {
                self.unacked.pop_front();
                freed += len;
                continue;
            }
            let start = end - len;
            if start < ack {
                let cut = ack - start;
                if let Some(front) = self.unacked.front_mut() {
                    front.1 = front.1.slice(cut as usize..);
                }
                freed += cut;
            }
            break;
        }

        self.acked = ack;
        self.shared.budget.add_permits(freed as usize);
    }

    async fn on_outbound(&mut self, framed: &mut RelayFramed, chunk: Bytes) -> Result<(), Interrupt> {
        self.sent += chunk.len() as u64;
        self.unacked.push_back((self.sent, chunk.clone()));
        self.stage(
            framed,
            Frame::Data {
                seq: self.sent,
                payload: chunk,
            },
        )
        .await?;
        self.written = self.sent;
        self.flush(framed).await
    }

    async fn ack_if_over_threshold(&mut self, framed: &mut RelayFramed) -> Result<(), Interrupt> {
        if self.delivered - self.last_ack_sent >= self.config.ack_threshold as u64 {
            self.send_ack(framed).await
        } else {
            Ok(())
        }
    }

    async fn send_ack(&mut self, framed: &mut RelayFramed) -> Result<(), Interrupt> {
        if self.delivered <= self.last_ack_sent {
            return Ok(());
        }
        let ack = self.delivered;
        self.write(framed, Frame::Ack { ack }).await?;
        self.last_ack_sent = ack;
        Ok(())
    }

    /// Write a frame, giving up if the connection is being closed
    async fn write(&self, framed: &mut RelayFramed, frame: Frame) -> Result<(), Interrupt> {
        self.stage(framed, frame).await?;
        self.flush(framed).await
    }

    /// Queue a frame in the codec's write buffer
    ///
    /// A frame is either fully staged or not at all. Staged frames go out
    /// with the next flush, including the one in `shutdown`.
    async fn stage(&self, framed: &mut RelayFramed, frame: Frame) -> Result<(), Interrupt> {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => return Err(Interrupt::Cancelled),
            ready = poll_fn(|cx| framed.poll_ready_unpin(cx)) => ready?,
        }
        framed.start_send_unpin(frame)?;
        Ok(())
    }

    async fn flush(&self, framed: &mut RelayFramed) -> Result<(), Interrupt> {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = framed.flush() => result.map_err(Interrupt::from),
        }
    }

    fn consumer_present(&self) -> bool {
        self.inbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn abandon_reader(&mut self) {
        debug!(sid = %self.shared.sid_label, "Reader dropped, discarding inbound data");
        self.inbound = None;
        self.pending.clear();
        self.delivered = self.received;
    }

    /// Resume the session on a fresh transport
    ///
    /// `Err(None)` means the connection was closed while waiting.
    async fn reconnect(&mut self) -> Result<RelayFramed, Option<RelayError>> {
        self.shared.set_state(ConnectionState::Reconnecting);
        let cancel = self.shared.cancel.clone();

        loop {
            let delay = self.reconnector.next_delay().map_err(|e| {
                Some(RelayError::TransportFault(e.to_string()))
            })?;

            tokio::select! {
                _ = cancel.cancelled() => return Err(None),
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = self.reconnector.attempt();
            info!(
                target: AUDIT_TARGET,
                destination = %self.shared.destination,
                sid = %self.shared.sid_label,
                attempt,
                "Attempting to resume relay session"
            );

            let timeout = self.config.connect_timeout;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(None),
                result = tokio::time::timeout(timeout, self.resume()) => {
                    result.unwrap_or(Err(RelayError::Timeout))
                }
            };

            match result {
                Ok(framed) => {
                    self.reconnector.reset();
                    self.shared.set_state(ConnectionState::Established);
                    info!(
                        target: AUDIT_TARGET,
                        destination = %self.shared.destination,
                        sid = %self.shared.sid_label,
                        acked = self.acked,
                        retransmitted = self.sent - self.acked,
                        "Relay session resumed"
                    );
                    return Ok(framed);
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        sid = %self.shared.sid_label,
                        attempt,
                        error = %err,
                        "Resume attempt failed"
                    );
                }
                Err(err) => return Err(Some(err)),
            }
        }
    }

    /// One RESUME handshake, retransmitting unacknowledged bytes on success
    async fn resume(&mut self) -> Result<RelayFramed, RelayError> {
        let credential = self.credentials.credential().await?;
        let stream = self
            .transport
            .connect(credential.client_certificate.as_ref())
            .await?;
        self.shared
            .mutual_tls
            .store(credential.client_certificate.is_some(), Ordering::SeqCst);

        let mut framed = Framed::new(stream, FrameCodec);
        framed
            .send(Frame::Resume {
                sid: self.shared.sid.clone(),
                received: self.received,
            })
            .await?;

        match framed.next().await {
            Some(Ok(Frame::ResumeSuccessAck { ack })) => {
                if ack < self.acked || ack > self.sent {
                    return Err(RelayError::ProtocolViolation(format!(
                        "RESUME ack {} outside [{}, {}]",
                        ack, self.acked, self.sent
                    )));
                }
                self.trim(ack);

                for (end, payload) in &self.unacked {
                    framed
                        .feed(Frame::Data {
                            seq: *end,
                            payload: payload.clone(),
                        })
                        .await?;
                }
                framed.flush().await?;
                self.written = self.sent;

                Ok(framed)
            }
            Some(Ok(Frame::ConnectFail { code, reason })) | Some(Ok(Frame::Close { code, reason })) => {
                Err(RelayError::from_close(code, reason))
            }
            Some(Ok(other)) => Err(RelayError::ProtocolViolation(format!(
                "expected RESUME_SUCCESS_ACK, got {:?}",
                other.tag()
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(RelayError::TransportFault(
                "relay closed the transport during resume".to_string(),
            )),
        }
    }

    /// Hand remaining inbound data to the reader after a normal remote close
    async fn drain_pending(&mut self) {
        let Some(tx) = self.inbound.clone() else {
            return;
        };
        let cancel = self.shared.cancel.clone();

        while let Some(chunk) = self.pending.pop_front() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = tx.send(chunk) => if result.is_err() { break },
            }
        }
    }

    /// Flush queued sends, send CLOSE and shut the transport down
    async fn shutdown(&mut self, framed: &mut RelayFramed) {
        let close_timeout = self.config.close_timeout;

        let flush = async {
            // DATA the pump accepted but never staged
            for (end, payload) in &self.unacked {
                if *end > self.written {
                    framed
                        .feed(Frame::Data {
                            seq: *end,
                            payload: payload.clone(),
                        })
                        .await?;
                }
            }
            self.written = self.sent;

            while let Ok(chunk) = self.outbound.try_recv() {
                self.sent += chunk.len() as u64;
                self.unacked.push_back((self.sent, chunk.clone()));
                framed
                    .feed(Frame::Data {
                        seq: self.sent,
                        payload: chunk,
                    })
                    .await?;
                self.written = self.sent;
            }
            if self.delivered > self.last_ack_sent {
                framed.feed(Frame::Ack { ack: self.delivered }).await?;
                self.last_ack_sent = self.delivered;
            }
            framed
                .feed(Frame::close(CloseCode::NORMAL, "client closed"))
                .await?;
            framed.close().await
        };

        match tokio::time::timeout(close_timeout, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error while closing relay transport: {}", e),
            Err(_) => debug!("Timed out closing relay transport"),
        }
    }

    /// Best-effort CLOSE with an error code
    async fn send_close(&mut self, framed: &mut RelayFramed, code: CloseCode, reason: String) {
        let close = async {
            framed.send(Frame::close(code, reason)).await?;
            framed.close().await
        };
        if let Err(_) | Ok(Err(_)) = tokio::time::timeout(self.config.close_timeout, close).await {
            debug!("Could not deliver CLOSE {} to relay", code);
        }
    }

    fn finish(&mut self, error: Option<RelayError>) {
        match error {
            None => {
                info!(
                    target: AUDIT_TARGET,
                    destination = %self.shared.destination,
                    sid = %self.shared.sid_label,
                    sent = self.sent,
                    received = self.received,
                    "Relay connection closed"
                );
                self.shared.set_state(ConnectionState::Closed);
            }
            Some(err) => {
                warn!(
                    target: AUDIT_TARGET,
                    destination = %self.shared.destination,
                    sid = %self.shared.sid_label,
                    error = %err,
                    "Relay connection faulted"
                );
                // Set before the reader's channel closes so it observes the fault
                let _ = self.shared.fault.set(err);
                self.shared.set_state(ConnectionState::Faulted);
            }
        }

        self.shared.cancel.cancel();
        self.shared.budget.close();
        self.outbound.close();
        self.inbound = None;
        self.pending.clear();
    }
}
