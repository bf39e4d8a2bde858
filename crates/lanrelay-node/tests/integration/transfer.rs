//! File transfer tests -- offer/accept/stream/verify between two nodes, plus
//! rejection paths and a sender that lies about the hash.

use std::sync::Arc;
use std::time::Duration;

use lanrelay_crypto::md5_hex;
use lanrelay_node::file_transfer::send_text;
use lanrelay_node::tables::NodeEvent;
use lanrelay_node::transport::{Connection, ConnectionEvent, TcpClient};
use lanrelay_protocol::{FileTransferRequest, Frame, FrameKind};
use lanrelay_transfer::{Fs2DiskSpace, TransferStatus};
use uuid::Uuid;

use crate::harness::{FixedSpace, TestNode};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn auto_accepting(name: &str) -> TestNode {
    TestNode::start_with(name, Vec::new(), |cfg| cfg.node.auto_accept = true, Arc::new(Fs2DiskSpace))
        .await
        .unwrap()
}

/// Offer, auto-accept, stream in many chunks, verify on both ends.
#[tokio::test]
async fn test_transfer_completes_and_verifies() {
    let receiver = auto_accepting("receiver").await;
    let sender = TestNode::start("sender", Vec::new()).await.unwrap();

    let data = pattern(100_000);
    let source = sender.scratch_dir().join("report.bin");
    std::fs::write(&source, &data).unwrap();

    let conn = sender.node.connect(receiver.addr(), false).await.unwrap();
    let id = sender
        .node
        .ctx
        .transfers
        .offer(&conn, &source, Some(receiver.device_id))
        .await
        .unwrap();

    let sent = sender.wait_transfer_done(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(sent.status, TransferStatus::Completed);
    assert!(sent.is_outgoing);
    assert_eq!(sent.progress, 1.0);

    let received = receiver.wait_transfer_done(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(received.status, TransferStatus::Completed, "{:?}", received.error_message);
    assert!(!received.is_outgoing);
    assert_eq!(received.file_size, data.len() as u64);

    let saved = received.local_file_path.unwrap();
    assert_eq!(saved, receiver.download_dir().join("report.bin"));
    assert_eq!(std::fs::read(saved).unwrap(), data);

    let history = sender
        .node
        .ctx
        .transfers
        .transfers()
        .for_device(&receiver.device_id)
        .await;
    assert_eq!(history.len(), 1);

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// Manual decisions: a rejection reaches the sender with its reason, an
/// accept streams the file.
#[tokio::test]
async fn test_manual_reject_then_accept() {
    let receiver = TestNode::start("receiver", Vec::new()).await.unwrap();
    let sender = TestNode::start("sender", Vec::new()).await.unwrap();
    let source = sender.scratch_dir().join("notes.txt");
    std::fs::write(&source, b"meeting notes").unwrap();
    let conn = sender.node.connect(receiver.addr(), false).await.unwrap();

    let first = sender.node.ctx.transfers.offer(&conn, &source, None).await.unwrap();
    let pending = receiver.wait_any_transfer(Duration::from_secs(5)).await.unwrap();
    assert_eq!(pending.transfer_id, first);
    assert_eq!(pending.status, TransferStatus::Pending);

    receiver.node.ctx.transfers.reject(&first, "not now").await.unwrap();
    let refused = sender.wait_transfer_done(first, Duration::from_secs(5)).await.unwrap();
    assert_eq!(refused.status, TransferStatus::Rejected);
    assert_eq!(refused.error_message.as_deref(), Some("not now"));

    // A second decision on the same transfer is refused
    assert!(receiver.node.ctx.transfers.accept(&first).await.is_err());

    let second = sender.node.ctx.transfers.offer(&conn, &source, None).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while receiver.node.ctx.transfers.transfers().get(&second).await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "request never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let path = receiver.node.ctx.transfers.accept(&second).await.unwrap();

    let done = receiver.wait_transfer_done(second, Duration::from_secs(5)).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(std::fs::read(path).unwrap(), b"meeting notes");

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// Not enough room: refused up front, nothing written.
#[tokio::test]
async fn test_insufficient_space_rejects() {
    let receiver = TestNode::start_with(
        "receiver",
        Vec::new(),
        |cfg| cfg.node.auto_accept = true,
        Arc::new(FixedSpace(10)),
    )
    .await
    .unwrap();
    let sender = TestNode::start("sender", Vec::new()).await.unwrap();
    let source = sender.scratch_dir().join("big.bin");
    std::fs::write(&source, pattern(1000)).unwrap();

    let conn = sender.node.connect(receiver.addr(), false).await.unwrap();
    let id = sender.node.ctx.transfers.offer(&conn, &source, None).await.unwrap();

    let refused = sender.wait_transfer_done(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(refused.status, TransferStatus::Rejected);
    assert!(refused.error_message.unwrap().contains("insufficient disk space"));

    let local = receiver.wait_transfer_done(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(local.status, TransferStatus::Rejected);
    assert!(!receiver.download_dir().join("big.bin").exists());

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// Bytes that do not match the announced hash end Failed, not Completed.
#[tokio::test]
async fn test_hash_mismatch_fails() {
    let receiver = auto_accepting("receiver").await;

    let client = TcpClient::default();
    let (conn, mut events) = client.connect(receiver.addr()).await.unwrap();

    let data = pattern(5000);
    let mut corrupted = data.clone();
    corrupted[1234] ^= 0xFF;
    let request = FileTransferRequest {
        transfer_id: Uuid::new_v4(),
        file_name: "photo.jpg".into(),
        file_size: data.len() as u64,
        md5_hash: md5_hex(&data),
    };
    conn.send(Frame::file_request(&request).unwrap()).await.unwrap();

    let response = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(ConnectionEvent::Message { frame, .. }) if frame.kind() == FrameKind::FileAck => {
                break frame.to_file_response().unwrap();
            }
            Some(_) => continue,
            None => panic!("connection closed before the response"),
        }
    };
    assert!(response.accepted);

    for chunk in corrupted.chunks(1000) {
        conn.send(Frame::file_data(chunk.to_vec())).await.unwrap();
    }

    let failed = receiver
        .wait_transfer_done(request.transfer_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(failed.error_message.unwrap().contains("hash mismatch"));
    assert!(!receiver.download_dir().join("photo.jpg").exists());

    client.disconnect().await;
    receiver.shutdown().await;
}

/// A sender that hangs up mid-stream leaves a Failed transfer and no file.
#[tokio::test]
async fn test_disconnect_mid_transfer_fails() {
    let receiver = auto_accepting("receiver").await;
    let client = TcpClient::default();
    let (conn, mut events) = client.connect(receiver.addr()).await.unwrap();

    let data = pattern(8000);
    let request = FileTransferRequest {
        transfer_id: Uuid::new_v4(),
        file_name: "half.bin".into(),
        file_size: data.len() as u64,
        md5_hash: md5_hex(&data),
    };
    conn.send(Frame::file_request(&request).unwrap()).await.unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(ConnectionEvent::Message { frame, .. }) if frame.kind() == FrameKind::FileAck => break,
            Some(_) => continue,
            None => panic!("connection closed before the response"),
        }
    }
    conn.send(Frame::file_data(data[..4000].to_vec())).await.unwrap();
    client.disconnect().await;

    let failed = receiver
        .wait_transfer_done(request.transfer_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("connection closed"));
    assert!(!receiver.download_dir().join("half.bin").exists());

    receiver.shutdown().await;
}

/// Large enough that the stream is still running when the cancel lands.
const LARGE_FILE: usize = 64 * 1024 * 1024;

/// Offer a small file on `conn` and check both ends complete it.
async fn send_and_verify(
    sender: &TestNode,
    receiver: &TestNode,
    conn: &Arc<Connection>,
    name: &str,
    data: &[u8],
) {
    let source = sender.scratch_dir().join(name);
    std::fs::write(&source, data).unwrap();
    let id = sender.node.ctx.transfers.offer(conn, &source, None).await.unwrap();

    let sent = sender.wait_transfer_done(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(sent.status, TransferStatus::Completed, "{:?}", sent.error_message);
    let received = receiver.wait_transfer_done(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(received.status, TransferStatus::Completed, "{:?}", received.error_message);
    assert_eq!(std::fs::read(received.local_file_path.unwrap()).unwrap(), data);
}

/// The sender stops mid-stream: both ends end Cancelled and the connection
/// is free for the next transfer.
#[tokio::test]
async fn test_sender_cancel_mid_stream() {
    let receiver = auto_accepting("receiver").await;
    let sender = TestNode::start("sender", Vec::new()).await.unwrap();
    let source = sender.scratch_dir().join("huge.bin");
    std::fs::write(&source, pattern(LARGE_FILE)).unwrap();

    let conn = sender.node.connect(receiver.addr(), false).await.unwrap();
    let id = sender.node.ctx.transfers.offer(&conn, &source, None).await.unwrap();
    receiver.wait_transfer_started(id, Duration::from_secs(10)).await.unwrap();

    sender.node.ctx.transfers.cancel(&id).await.unwrap();

    let local = sender.wait_transfer_done(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(local.status, TransferStatus::Cancelled);
    let remote = receiver.wait_transfer_done(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(remote.status, TransferStatus::Cancelled);
    assert_eq!(remote.error_message.as_deref(), Some("cancelled by sender"));
    assert!(!receiver.download_dir().join("huge.bin").exists());
    assert!(!conn.is_closed());

    send_and_verify(&sender, &receiver, &conn, "after.txt", b"hello again").await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// The receiver stops mid-stream: the sender stops too, and data still in
/// flight never leaks into the next transfer on the connection.
#[tokio::test]
async fn test_receiver_cancel_mid_stream() {
    let receiver = auto_accepting("receiver").await;
    let sender = TestNode::start("sender", Vec::new()).await.unwrap();
    let source = sender.scratch_dir().join("huge.bin");
    std::fs::write(&source, pattern(LARGE_FILE)).unwrap();

    let conn = sender.node.connect(receiver.addr(), false).await.unwrap();
    let id = sender.node.ctx.transfers.offer(&conn, &source, None).await.unwrap();
    receiver.wait_transfer_started(id, Duration::from_secs(10)).await.unwrap();

    receiver.node.ctx.transfers.cancel(&id).await.unwrap();

    let local = receiver.wait_transfer_done(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(local.status, TransferStatus::Cancelled);
    assert!(!receiver.download_dir().join("huge.bin").exists());
    let remote = sender.wait_transfer_done(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(remote.status, TransferStatus::Cancelled);
    assert_eq!(remote.error_message.as_deref(), Some("cancelled by receiver"));

    send_and_verify(&sender, &receiver, &conn, "small.txt", b"11 bytes!!!").await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// A replayed request for a finished transfer does not reopen it.
#[tokio::test]
async fn test_repeated_request_ignored() {
    let receiver = auto_accepting("receiver").await;
    let client = TcpClient::default();
    let (conn, _events) = client.connect(receiver.addr()).await.unwrap();

    let data = b"tiny".to_vec();
    let request = FileTransferRequest {
        transfer_id: Uuid::new_v4(),
        file_name: "tiny.txt".into(),
        file_size: data.len() as u64,
        md5_hash: md5_hex(&data),
    };
    conn.send(Frame::file_request(&request).unwrap()).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while receiver
        .node
        .ctx
        .transfers
        .transfers()
        .get(&request.transfer_id)
        .await
        .map_or(true, |t| t.status != TransferStatus::InProgress)
    {
        assert!(tokio::time::Instant::now() < deadline, "request never accepted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    conn.send(Frame::file_data(data.clone())).await.unwrap();
    let done = receiver
        .wait_transfer_done(request.transfer_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(done.status, TransferStatus::Completed);

    // Frames are handled in order, so the marker means the replay was seen
    let mut bus = receiver.node.ctx.events.subscribe();
    conn.send(Frame::file_request(&request).unwrap()).await.unwrap();
    send_text(&conn, "marker").await.unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), bus.recv()).await.unwrap() {
            Ok(NodeEvent::MessageReceived { text, .. }) if text == "marker" => break,
            Ok(_) => continue,
            Err(e) => panic!("event bus error: {e}"),
        }
    }

    let after = receiver
        .node
        .ctx
        .transfers
        .transfers()
        .get(&request.transfer_id)
        .await
        .unwrap();
    assert_eq!(after.status, TransferStatus::Completed);
    assert_eq!(receiver.node.ctx.transfers.transfers().snapshot().await.len(), 1);

    client.disconnect().await;
    receiver.shutdown().await;
}

/// Text frames surface as message events.
#[tokio::test]
async fn test_text_message_event() {
    let receiver = TestNode::start("receiver", Vec::new()).await.unwrap();
    let mut bus = receiver.node.ctx.events.subscribe();

    let client = TcpClient::default();
    let (conn, _events) = client.connect(receiver.addr()).await.unwrap();
    send_text(&conn, "hello over the lan").await.unwrap();

    let text = loop {
        match tokio::time::timeout(Duration::from_secs(5), bus.recv()).await.unwrap() {
            Ok(NodeEvent::MessageReceived { text, remote }) => {
                assert_eq!(remote, conn.local_addr());
                break text;
            }
            Ok(_) => continue,
            Err(e) => panic!("event bus error: {e}"),
        }
    };
    assert_eq!(text, "hello over the lan");

    client.disconnect().await;
    receiver.shutdown().await;
}
