//! Transport tests -- framing over real sockets, malformed headers, ordering.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use lanrelay_node::transport::{ConnectionEvent, TcpClient, TcpServer, TransportError};
use lanrelay_protocol::{encode, Frame, FrameKind};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_message(rx: &mut mpsc::Receiver<ConnectionEvent>) -> Frame {
    loop {
        match next_event(rx).await {
            ConnectionEvent::Message { frame, .. } => return frame,
            ConnectionEvent::Opened(_) => continue,
            ConnectionEvent::Closed { remote } => panic!("connection {remote} closed"),
        }
    }
}

async fn wait_closed(rx: &mut mpsc::Receiver<ConnectionEvent>) {
    loop {
        if let ConnectionEvent::Closed { .. } = next_event(rx).await {
            return;
        }
    }
}

fn negative_length_header() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(FrameKind::Text.as_u8());
    buf.put_slice(&[0, 0, 0]);
    buf.put_u32(0x8000_0001);
    buf
}

/// A malformed header is skipped and the next frame still arrives.
#[tokio::test]
async fn test_lenient_framing_skips_bad_header() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();

    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    raw.write_all(&negative_length_header()).await.unwrap();
    raw.write_all(&encode(&Frame::text("after garbage"))).await.unwrap();

    let frame = next_message(&mut events).await;
    assert_eq!(frame.as_text().unwrap(), "after garbage");

    server.stop().await;
}

/// With strict framing the same header ends the connection.
#[tokio::test]
async fn test_strict_framing_closes_connection() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), true)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();

    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    raw.write_all(&negative_length_header()).await.unwrap();
    raw.write_all(&encode(&Frame::text("never seen"))).await.unwrap();

    loop {
        match next_event(&mut events).await {
            ConnectionEvent::Closed { .. } => break,
            ConnectionEvent::Message { frame, .. } => panic!("unexpected frame {frame:?}"),
            ConnectionEvent::Opened(_) => {}
        }
    }

    server.stop().await;
}

/// A header announcing a body past the frame limit ends the connection
/// even with lenient framing, before the body is buffered.
#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();

    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut header = BytesMut::new();
    header.put_u8(FrameKind::FileData.as_u8());
    header.put_slice(&[0, 0, 0]);
    header.put_u32(0x7FFF_FFFF);
    raw.write_all(&header).await.unwrap();
    raw.write_all(&[0u8; 4096]).await.unwrap();

    loop {
        match next_event(&mut events).await {
            ConnectionEvent::Closed { .. } => break,
            ConnectionEvent::Message { frame, .. } => panic!("unexpected frame {frame:?}"),
            ConnectionEvent::Opened(_) => {}
        }
    }

    server.stop().await;
}

/// Bodies that contain header-shaped bytes are delivered intact.
#[tokio::test]
async fn test_binary_body_with_header_lookalike() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();
    let client = TcpClient::default();
    client.connect(server.local_addr()).await.unwrap();

    let inner = encode(&Frame::text("nested"));
    let mut body = inner.to_vec();
    body.extend_from_slice(&[0xFF; 100]);
    body.extend_from_slice(&inner);
    client.send(Frame::file_data(body.clone())).await.unwrap();
    client.send(Frame::heartbeat()).await.unwrap();

    let data = next_message(&mut events).await;
    assert_eq!(data.kind(), FrameKind::FileData);
    assert_eq!(data.body().as_ref(), body.as_slice());
    assert_eq!(next_message(&mut events).await.kind(), FrameKind::Heartbeat);

    client.disconnect().await;
    server.stop().await;
}

/// Concurrent senders on one connection never interleave frames.
#[tokio::test]
async fn test_concurrent_sends_are_not_interleaved() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();
    let client = TcpClient::default();
    let (conn, _client_events) = client.connect(server.local_addr()).await.unwrap();

    let mut tasks = Vec::new();
    for sender in 0..8u8 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                conn.send(Frame::file_data(vec![sender; 3000])).await.unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    for _ in 0..200 {
        let frame = next_message(&mut events).await;
        let body = frame.body();
        assert_eq!(body.len(), 3000);
        assert!(body.iter().all(|b| *b == body[0]));
    }

    client.disconnect().await;
    server.stop().await;
}

/// Peer hang-up raises exactly one Closed and removes the connection.
#[tokio::test]
async fn test_peer_close_fires_single_closed() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();

    let client = TcpClient::default();
    client.connect(server.local_addr()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Opened(_)));

    client.disconnect().await;
    wait_closed(&mut events).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err(),
        "no further events expected"
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.connection_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "connection not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.stop().await;
}

/// Stopping the listener closes live connections; their sends then fail.
#[tokio::test]
async fn test_stop_closes_connections() {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let mut events = server.start().await.unwrap();

    let client = TcpClient::default();
    let (_conn, mut client_events) = client.connect(server.local_addr()).await.unwrap();
    let server_conn = match next_event(&mut events).await {
        ConnectionEvent::Opened(c) => c,
        other => panic!("expected Opened, got {other:?}"),
    };

    server.stop().await;
    wait_closed(&mut client_events).await;
    assert!(server_conn.is_closed());
    assert!(matches!(
        server_conn.send(Frame::heartbeat()).await,
        Err(TransportError::Closed)
    ));
    assert!(!client.is_connected().await);

    // Reconnecting elsewhere after the old link died is allowed
    let other = TcpServer::bind("127.0.0.1:0".parse().unwrap(), false)
        .await
        .unwrap();
    let _other_events = other.start().await.unwrap();
    let reconnected: Arc<_> = client.connect(other.local_addr()).await.unwrap().0;
    assert!(!reconnected.is_closed());
    other.stop().await;
}
