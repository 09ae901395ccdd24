//! RelayConnection against a scripted relay over the in-memory transport

mod common;

use bytes::Bytes;
use common::*;
use futures::StreamExt;
use iaptunnel_connection::{
    ConnectionState, RelayConfig, RelayConnection, RelayCredential, RelayError, SharedCredential,
};
use iaptunnel_proto::{CloseCode, Frame};
use iaptunnel_transport::{memory_transport, memory_transport_with_capacity, ClientCertificate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_open_send_receive_close() {
    let (connector, acceptor) = memory_transport();
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(conn.handle().sid(), &Bytes::from_static(SID));
    assert!(!conn.is_mutual_tls());

    conn.send(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(5, b"hello"));

    relay.send_data(3, b"abc").await;
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"abc")));

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);

    match relay.recv_skip_acks().await {
        Frame::Close { code, .. } => assert_eq!(code, CloseCode::NORMAL),
        other => panic!("expected CLOSE, got {:?}", other),
    }

    // Idempotent
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_connect_carries_destination_and_token() {
    let (connector, acceptor) = memory_transport();

    let open = RelayConnection::open(
        Arc::new(connector.clone()),
        destination(22),
        credential("secret-token"),
        fast_config(),
    );
    let relay = async {
        let mut relay = RelaySide::accept(&acceptor).await;
        let connect = relay.expect_connect().await;
        relay
            .send(Frame::ConnectSuccessSid {
                sid: Bytes::from_static(SID),
            })
            .await;
        (relay, connect)
    };

    let (conn, (_relay, (dest, token))) = tokio::join!(open, relay);
    assert!(conn.is_ok());
    assert_eq!(dest, destination(22));
    assert_eq!(token, "secret-token");
}

#[tokio::test]
async fn test_large_writes_are_chunked() {
    let (connector, acceptor) = memory_transport();
    let config = fast_config().with_max_data_frame_size(4);
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, config).await;

    conn.send(Bytes::from_static(b"0123456789")).await.unwrap();

    assert_eq!(relay.recv_skip_acks().await, data(4, b"0123"));
    assert_eq!(relay.recv_skip_acks().await, data(8, b"4567"));
    assert_eq!(relay.recv_skip_acks().await, data(10, b"89"));
}

#[tokio::test]
async fn test_connect_rejected_is_unauthorized() {
    let (connector, acceptor) = memory_transport();

    let open = RelayConnection::open(
        Arc::new(connector.clone()),
        destination(3389),
        credential("bad-token"),
        fast_config(),
    );
    let relay = async {
        let mut relay = RelaySide::accept(&acceptor).await;
        relay.expect_connect().await;
        relay
            .send(Frame::ConnectFail {
                code: CloseCode::NOT_AUTHORIZED,
                reason: "token rejected".to_string(),
            })
            .await;
        relay
    };

    let (result, _relay) = tokio::join!(open, relay);
    match result {
        Err(RelayError::Unauthorized { code, reason }) => {
            assert_eq!(code, CloseCode::NOT_AUTHORIZED);
            assert_eq!(reason, "token rejected");
        }
        other => panic!("expected Unauthorized, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_close_during_handshake_is_classified_by_code() {
    let (connector, acceptor) = memory_transport();

    let open = RelayConnection::open(
        Arc::new(connector.clone()),
        destination(3389),
        credential("token"),
        fast_config(),
    );
    let relay = async {
        let mut relay = RelaySide::accept(&acceptor).await;
        relay.expect_connect().await;
        relay
            .send(Frame::close(CloseCode::ERROR_UNKNOWN, "backend unavailable"))
            .await;
        relay
    };

    let (result, _relay) = tokio::join!(open, relay);
    match result {
        Err(RelayError::Remote { code, reason }) => {
            assert_eq!(code, CloseCode::ERROR_UNKNOWN);
            assert_eq!(reason, "backend unavailable");
        }
        other => panic!("expected Remote, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_connect_timeout() {
    let (connector, acceptor) = memory_transport();
    let config = fast_config().with_connect_timeout(Duration::from_millis(100));

    let open = RelayConnection::open(
        Arc::new(connector.clone()),
        destination(3389),
        credential("token"),
        config,
    );
    // Relay reads CONNECT and never answers
    let relay = async {
        let mut relay = RelaySide::accept(&acceptor).await;
        relay.expect_connect().await;
        relay
    };

    let (result, _relay) = tokio::join!(open, relay);
    assert_eq!(result.map(|_| ()), Err(RelayError::Timeout));
}

#[tokio::test]
async fn test_open_cancelled_during_handshake() {
    let (connector, acceptor) = memory_transport();
    let cancel = CancellationToken::new();

    let open = RelayConnection::open_with_cancel(
        Arc::new(connector.clone()),
        destination(3389),
        credential("token"),
        fast_config(),
        cancel.clone(),
    );
    let relay = async {
        let mut relay = RelaySide::accept(&acceptor).await;
        relay.expect_connect().await;
        cancel.cancel();
        relay
    };

    let (result, _relay) = tokio::join!(open, relay);
    assert_eq!(result.map(|_| ()), Err(RelayError::Closed));
}

#[tokio::test]
async fn test_resume_after_transport_drop_is_lossless() {
    let (connector, acceptor) = memory_transport();
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

    conn.send(Bytes::from_static(b"aaaa")).await.unwrap();
    conn.send(Bytes::from_static(b"bbbb")).await.unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(4, b"aaaa"));
    assert_eq!(relay.recv_skip_acks().await, data(8, b"bbbb"));

    relay.send(Frame::Ack { ack: 4 }).await;
    relay.send_data(3, b"xyz").await;
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"xyz")));

    // Transport loss
    drop(relay);

    let mut relay = RelaySide::accept(&acceptor).await;
    assert_eq!(relay.connection_id, 2);
    assert_eq!(
        relay.recv().await,
        Frame::Resume {
            sid: Bytes::from_static(SID),
            received: 3,
        }
    );

    // The relay saw six of the eight bytes: exactly the last two come again
    relay.send(Frame::ResumeSuccessAck { ack: 6 }).await;
    assert_eq!(relay.recv_skip_acks().await, data(8, b"bb"));

    // Overlapping retransmission from the relay is trimmed
    relay.send_data(6, b"yzabc").await;
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"abc")));

    // Wholly duplicate frame is dropped
    relay.send_data(6, b"abc").await;
    relay.send_data(7, b"d").await;
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"d")));

    conn.send(Bytes::from_static(b"cc")).await.unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(10, b"cc"));

    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn test_reconnect_budget_exhaustion_faults() {
    let (connector, acceptor) = memory_transport();
    let config = fast_config();
    let (conn, relay) = open_connection(&connector, &acceptor, config.clone()).await;
    let (mut writer, mut reader) = conn.split();

    connector.set_offline(true);
    let started = Instant::now();
    drop(relay);

    let err = tokio::time::timeout(STEP, reader.recv())
        .await
        .expect("reader was not released")
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RelayError::TransportFault(_)), "{:?}", err);
    assert_eq!(reader.handle().state(), ConnectionState::Faulted);

    let bound = config.reconnect.max_total_backoff().unwrap() + Duration::from_secs(1);
    assert!(elapsed < bound, "released after {:?}", elapsed);

    // Initial connect plus three resume attempts
    assert_eq!(connector.connect_attempts(), 4);

    assert!(writer.send(Bytes::from_static(b"late")).await.is_err());
}

#[tokio::test]
async fn test_resume_rejected_session_expired() {
    let (connector, acceptor) = memory_transport();
    let (conn, relay) = open_connection(&connector, &acceptor, fast_config()).await;
    let (_writer, mut reader) = conn.split();

    drop(relay);

    let mut relay = RelaySide::accept(&acceptor).await;
    assert!(matches!(relay.recv().await, Frame::Resume { .. }));
    relay
        .send(Frame::ConnectFail {
            code: CloseCode::SID_UNKNOWN,
            reason: "unknown session".to_string(),
        })
        .await;

    let err = tokio::time::timeout(STEP, reader.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RelayError::SessionExpired { .. }), "{:?}", err);

    // Not retried
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn test_resume_ack_out_of_range_is_protocol_violation() {
    let (connector, acceptor) = memory_transport();
    let (conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;
    let (mut writer, mut reader) = conn.split();

    writer.send(Bytes::from_static(b"abcd")).await.unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(4, b"abcd"));
    drop(relay);

    let mut relay = RelaySide::accept(&acceptor).await;
    assert!(matches!(relay.recv().await, Frame::Resume { .. }));
    relay.send(Frame::ResumeSuccessAck { ack: 10 }).await;

    let err = tokio::time::timeout(STEP, reader.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RelayError::ProtocolViolation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_backpressure_suspends_until_ack_and_fails_after_close() {
    let (connector, acceptor) = memory_transport();
    let config = fast_config()
        .with_max_data_frame_size(4)
        .with_retransmit_buffer_capacity(8);
    let (conn, mut relay) = open_connection(&connector, &acceptor, config).await;
    let (mut writer, _reader) = conn.split();
    let handle = writer.handle().clone();

    // Fills the buffer exactly
    writer.send(Bytes::from_static(b"aaaabbbb")).await.unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(4, b"aaaa"));
    assert_eq!(relay.recv_skip_acks().await, data(8, b"bbbb"));

    let blocked = tokio::spawn(async move {
        writer.send(Bytes::from_static(b"cccc")).await.map(|_| writer)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "send should wait for an ACK");

    relay.send(Frame::Ack { ack: 4 }).await;
    let mut writer = tokio::time::timeout(STEP, blocked)
        .await
        .expect("send still blocked after ACK")
        .unwrap()
        .unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(12, b"cccc"));

    // Full again; closing must release the waiting sender with an error
    let blocked = tokio::spawn(async move { writer.send(Bytes::from_static(b"dddd")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    handle.close().await;
    let result = tokio::time::timeout(STEP, blocked).await.unwrap().unwrap();
    assert_eq!(result, Err(RelayError::Closed));
}

#[tokio::test]
async fn test_remote_normal_close_ends_stream() {
    let (connector, acceptor) = memory_transport();
    let (conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;
    let (_writer, mut reader) = conn.split();

    relay.send_data(2, b"hi").await;
    relay
        .send(Frame::close(CloseCode::NORMAL, "backend closed"))
        .await;

    assert_eq!(reader.next().await, Some(Ok(Bytes::from_static(b"hi"))));
    assert_eq!(reader.next().await, None);
    assert_eq!(reader.handle().closed().await, ConnectionState::Closed);
}

#[tokio::test]
async fn test_remote_error_close_faults() {
    let (connector, acceptor) = memory_transport();
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

    relay
        .send(Frame::close(CloseCode::NOT_AUTHORIZED, "access revoked"))
        .await;

    let err = conn.recv().await.unwrap_err();
    assert!(err.is_unauthorized(), "{:?}", err);
    assert_eq!(conn.state(), ConnectionState::Faulted);
}

#[tokio::test]
async fn test_data_gap_is_protocol_violation() {
    let (connector, acceptor) = memory_transport();
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

    relay.send_data(10, b"abc").await;

    let err = conn.recv().await.unwrap_err();
    assert!(matches!(err, RelayError::ProtocolViolation(_)), "{:?}", err);

    match relay.recv_skip_acks().await {
        Frame::Close { code, .. } => assert_eq!(code, CloseCode::INVALID_DATA),
        other => panic!("expected CLOSE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ack_beyond_sent_is_protocol_violation() {
    let (connector, acceptor) = memory_transport();
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

    conn.send(Bytes::from_static(b"ab")).await.unwrap();
    assert_eq!(relay.recv_skip_acks().await, data(2, b"ab"));
    relay.send(Frame::Ack { ack: 5 }).await;

    let err = conn.recv().await.unwrap_err();
    assert!(matches!(err, RelayError::ProtocolViolation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_ack_sent_at_threshold() {
    let (connector, acceptor) = memory_transport();
    let config = fast_config()
        .with_ack_threshold(4)
        .with_ack_interval(Duration::from_secs(60));
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, config).await;

    relay.send_data(3, b"abc").await;
    relay.send_data(6, b"def").await;

    assert_eq!(relay.recv().await, Frame::Ack { ack: 6 });
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"abc")));
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"def")));
}

#[tokio::test]
async fn test_ack_sent_on_interval() {
    let (connector, acceptor) = memory_transport();
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

    relay.send_data(3, b"abc").await;
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"abc")));

    // Below the threshold, so this ACK comes from the interval timer
    assert_eq!(relay.recv().await, Frame::Ack { ack: 3 });
}

#[tokio::test]
async fn test_credential_reread_on_resume() {
    let (connector, acceptor) = memory_transport();
    let first = ClientCertificate::from_pem("cert-1", "key-1");
    let second = ClientCertificate::from_pem("cert-2", "key-2");

    let credentials =
        SharedCredential::new(RelayCredential::bearer("t1").with_client_certificate(first.clone()));
    let (conn, relay) = open_with_credentials(
        &connector,
        &acceptor,
        fast_config(),
        Arc::new(credentials.clone()),
    )
    .await;
    assert_eq!(relay.client_certificate, Some(first));
    assert!(conn.is_mutual_tls());

    credentials
        .update(RelayCredential::bearer("t2").with_client_certificate(second.clone()))
        .await;
    drop(relay);

    let mut relay = RelaySide::accept(&acceptor).await;
    assert_eq!(relay.client_certificate, Some(second));
    assert!(matches!(relay.recv().await, Frame::Resume { .. }));
    relay.send(Frame::ResumeSuccessAck { ack: 0 }).await;

    let mut states = conn.handle().subscribe();
    tokio::time::timeout(
        STEP,
        states.wait_for(|state| *state == ConnectionState::Established),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_dropping_connection_closes_session() {
    let (connector, acceptor) = memory_transport();
    let (conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;
    let handle = conn.handle().clone();

    drop(conn);

    match relay.recv_skip_acks().await {
        Frame::Close { code, .. } => assert_eq!(code, CloseCode::NORMAL),
        other => panic!("expected CLOSE, got {:?}", other),
    }
    assert_eq!(handle.closed().await, ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_flushes_queued_sends() {
    // Close races the driver picking up the chunk, so run it many times
    for _ in 0..32 {
        let (connector, acceptor) = memory_transport();
        let (mut conn, mut relay) = open_connection(&connector, &acceptor, fast_config()).await;

        conn.send(Bytes::from_static(b"last words")).await.unwrap();
        conn.close().await;

        assert_eq!(relay.recv_skip_acks().await, data(10, b"last words"));
        assert!(matches!(relay.recv_skip_acks().await, Frame::Close { .. }));
        assert_eq!(relay.next().await, None);
    }
}

#[tokio::test]
async fn test_close_with_stalled_transport_delivers_every_accepted_byte() {
    let (connector, acceptor) = memory_transport_with_capacity(64);
    let config = fast_config()
        .with_max_data_frame_size(1024)
        .with_close_timeout(STEP);
    let (mut conn, mut relay) = open_connection(&connector, &acceptor, config).await;

    // The relay is not reading, so the driver blocks mid-write
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    conn.send(Bytes::from(payload.clone())).await.unwrap();

    let close = tokio::spawn(async move {
        conn.close().await;
        conn.state()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut received = Vec::new();
    loop {
        match relay.recv_skip_acks().await {
            Frame::Data { seq, payload } => {
                received.extend_from_slice(&payload);
                assert_eq!(seq, received.len() as u64);
            }
            Frame::Close { code, .. } => {
                assert_eq!(code, CloseCode::NORMAL);
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(received, payload);

    let state = tokio::time::timeout(STEP, close).await.unwrap().unwrap();
    assert_eq!(state, ConnectionState::Closed);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (connector, _acceptor) = memory_transport();
    let config = RelayConfig::default().with_max_data_frame_size(0);

    let result = RelayConnection::open(
        Arc::new(connector.clone()),
        destination(3389),
        credential("token"),
        config,
    )
    .await;

    assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
    assert_eq!(connector.connect_attempts(), 0);
}
