//! End-to-end engine tests over an in-memory byte stream
//!
//! A mock device stands in for the host USB stack and a scripted peer
//! drives the other end of a `tokio::io::duplex` pipe.

use backend::{
    BackendError, NullRelocationBlocker, RemoteBackend, RemoteDevice, Transfer, TransferState,
};
use protocol::{MessageType, RequestHeader, ResponseHeader, Token, TransferStatus};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// Host-side mock: records lifecycle events and completions in order
#[derive(Default)]
struct MockDevice {
    addr: AtomicU8,
    attached: AtomicBool,
    /// Transfers findable by the reader's fallback lookup
    live: Mutex<Vec<Arc<Transfer>>>,
    /// Ordered log of completions, disposals and address updates
    events: Mutex<Vec<String>>,
}

impl MockDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add_live(&self, transfer: Arc<Transfer>) {
        self.live.lock().unwrap().push(transfer);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl RemoteDevice for MockDevice {
    fn address(&self) -> u8 {
        self.addr.load(Ordering::Acquire)
    }

    fn set_address(&self, addr: u8) {
        self.addr.store(addr, Ordering::Release);
        self.events
            .lock()
            .unwrap()
            .push(format!("set_address {}", addr));
    }

    fn attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn on_attach(&self) {
        self.attached.store(true, Ordering::Release);
        self.events.lock().unwrap().push("attach".to_string());
    }

    fn on_detach(&self) {
        self.attached.store(false, Ordering::Release);
        self.events.lock().unwrap().push("detach".to_string());
    }

    fn find_transfer(&self, token: Token, ep: u8, id: u64) -> Option<Arc<Transfer>> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.token() == token && t.ep() == ep && t.id() == id)
            .cloned()
    }

    fn complete(&self, transfer: Arc<Transfer>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("complete {}", transfer.id()));
    }

    fn dispose(&self, transfer: Arc<Transfer>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("dispose {}", transfer.id()));
    }
}

fn new_engine() -> (Arc<RemoteBackend>, Arc<MockDevice>) {
    let device = MockDevice::new();
    let engine = RemoteBackend::new(device.clone(), Arc::new(NullRelocationBlocker));
    (engine, device)
}

async fn connect(engine: &Arc<RemoteBackend>) -> DuplexStream {
    let (local, peer) = tokio::io::duplex(256 * 1024);
    engine
        .attach_stream(Box::new(local))
        .await
        .expect("attach failed");
    peer
}

/// Read one REQUEST off the peer side of the pipe
async fn read_request(peer: &mut DuplexStream) -> (RequestHeader, Vec<u8>) {
    let mut tag = [0u8; 1];
    peer.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], MessageType::Request as u8);

    let mut body = [0u8; RequestHeader::SIZE];
    peer.read_exact(&mut body).await.unwrap();
    let header = RequestHeader::read_from(&mut Cursor::new(&body[..])).unwrap();

    let mut payload = vec![0u8; header.length as usize];
    if header.token.is_outbound() && header.length > 0 {
        peer.read_exact(&mut payload).await.unwrap();
    }

    (header, payload)
}

/// Write one RESPONSE to the peer side of the pipe
async fn send_response(peer: &mut DuplexStream, header: &ResponseHeader, payload: &[u8]) {
    let mut buf = vec![MessageType::Response as u8];
    header.write_to(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    peer.write_all(&buf).await.unwrap();
}

fn response(
    token: Token,
    ep: u8,
    id: u64,
    status: TransferStatus,
    length: u32,
    addr: u8,
) -> ResponseHeader {
    ResponseHeader {
        token,
        ep,
        id,
        status,
        length,
        addr,
    }
}

/// Give spawned tasks (reader, deferred context) a chance to run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Pipe whose write side can be killed while reads stay live, for
/// locally-initiated closure scenarios
struct FailingWriteLink {
    inner: DuplexStream,
    write_dead: Arc<AtomicBool>,
}

impl AsyncRead for FailingWriteLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FailingWriteLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_dead.load(Ordering::Acquire) {
            return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn submit_out_transfer_success() {
    let (engine, _device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(
        Token::Out,
        2,
        7,
        vec![0xAB; 10],
    ));

    let peer_task = tokio::spawn(async move {
        let (header, payload) = read_request(&mut peer).await;
        assert_eq!(header.token, Token::Out);
        assert_eq!(header.ep, 2);
        assert_eq!(header.id, 7);
        assert_eq!(header.length, 10);
        assert_eq!(payload, vec![0xAB; 10]);

        send_response(
            &mut peer,
            &response(Token::Out, 2, 7, TransferStatus::Success, 10, 0),
            &[],
        )
        .await;
        peer
    });

    let status = engine.submit(&transfer).await;
    assert_eq!(status, TransferStatus::Success);
    assert_eq!(transfer.status(), TransferStatus::Success);
    assert_eq!(transfer.actual(), 10);

    peer_task.await.unwrap();
}

#[tokio::test]
async fn submit_in_transfer_copies_payload() {
    let (engine, _device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(Token::In, 1, 3, vec![0; 4]));

    let peer_task = tokio::spawn(async move {
        let (header, _) = read_request(&mut peer).await;
        assert_eq!(header.token, Token::In);
        assert_eq!(header.length, 4);

        send_response(
            &mut peer,
            &response(Token::In, 1, 3, TransferStatus::Success, 4, 0),
            &[1, 2, 3, 4],
        )
        .await;
        peer
    });

    let status = engine.submit(&transfer).await;
    assert_eq!(status, TransferStatus::Success);
    assert_eq!(transfer.buffer(), vec![1, 2, 3, 4]);
    assert_eq!(transfer.actual(), 4);

    peer_task.await.unwrap();
}

#[tokio::test]
async fn submit_rejected_when_no_peer() {
    let (engine, _device) = new_engine();

    let transfer = Arc::new(Transfer::new(Token::In, 1, 1, vec![0; 8]));
    let status = engine.submit(&transfer).await;

    assert_eq!(status, TransferStatus::Stall);
    assert_eq!(transfer.status(), TransferStatus::Stall);
}

#[tokio::test]
async fn close_resolves_all_inflight_with_stall() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfers: Vec<_> = (0..3)
        .map(|i| Arc::new(Transfer::new(Token::In, 1, i, vec![0; 8])))
        .collect();

    let mut submits = Vec::new();
    for transfer in &transfers {
        let engine = engine.clone();
        let transfer = transfer.clone();
        submits.push(tokio::spawn(
            async move { engine.submit(&transfer).await },
        ));
    }

    // Let the requests reach the wire, then kill the connection.
    for _ in 0..3 {
        read_request(&mut peer).await;
    }
    drop(peer);

    for submit in submits {
        assert_eq!(submit.await.unwrap(), TransferStatus::Stall);
    }

    engine.wait_closed().await;
    assert!(!device.attached());
    assert!(!engine.is_open());
}

#[tokio::test(start_paused = true)]
async fn cancel_returns_within_timeout() {
    let (engine, _device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(Token::In, 1, 5, vec![0; 8]));
    transfer.set_state(TransferState::Canceled);

    let peer_task = tokio::spawn(async move {
        // Read the CANCEL but never acknowledge it.
        let mut buf = [0u8; 64];
        let _ = peer.read(&mut buf).await;
        peer
    });

    let started = tokio::time::Instant::now();
    engine.cancel(&transfer).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2));

    peer_task.await.unwrap();
}

#[tokio::test]
async fn oversized_payload_closes_connection() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(Token::In, 1, 1, vec![0; 8]));

    let engine2 = engine.clone();
    let t2 = transfer.clone();
    let submit = tokio::spawn(async move { engine2.submit(&t2).await });

    read_request(&mut peer).await;
    // Announce more than the 64 KiB ceiling.
    send_response(
        &mut peer,
        &response(Token::In, 1, 1, TransferStatus::Success, 70_000, 0),
        &[],
    )
    .await;

    assert_eq!(submit.await.unwrap(), TransferStatus::Stall);
    engine.wait_closed().await;
    assert!(!device.attached());
    // No payload was copied.
    assert_eq!(transfer.actual(), 0);
}

#[tokio::test]
async fn unexpected_inbound_type_closes_connection() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    // REQUEST is never legal inbound.
    peer.write_all(&[MessageType::Request as u8]).await.unwrap();

    engine.wait_closed().await;
    assert!(!device.attached());
}

#[tokio::test]
async fn completed_records_delivered_in_fifo_order() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    // Known to the consumer, but no inflight entries exist.
    for id in [1u64, 2, 3] {
        device.add_live(Arc::new(Transfer::new(Token::In, 2, id, vec![0; 4])));
    }

    for id in [1u64, 2, 3] {
        send_response(
            &mut peer,
            &response(Token::In, 2, id, TransferStatus::Success, 4, 0),
            &[id as u8; 4],
        )
        .await;
    }

    settle().await;

    let events = device.events();
    let completions: Vec<_> = events.iter().filter(|e| e.starts_with("complete")).collect();
    assert_eq!(completions, vec!["complete 1", "complete 2", "complete 3"]);

    // Payloads landed in the right buffers.
    let t2 = device.find_transfer(Token::In, 2, 2).unwrap();
    assert_eq!(t2.buffer(), vec![2; 4]);
}

#[tokio::test]
async fn set_address_applied_only_after_status_stage() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    // SET_ADDRESS 5: bmRequestType 0, bRequest 5, wValue 5.
    let setup = Arc::new(Transfer::new(
        Token::Setup,
        0,
        1,
        vec![0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00],
    ));

    let peer_task = tokio::spawn(async move {
        let (header, payload) = read_request(&mut peer).await;
        assert_eq!(header.token, Token::Setup);
        assert_eq!(payload[1], 0x05);
        send_response(
            &mut peer,
            &response(Token::Setup, 0, 1, TransferStatus::Success, 8, 0),
            &[],
        )
        .await;

        // Status stage: endpoint-0 IN.
        let (header, _) = read_request(&mut peer).await;
        assert_eq!(header.token, Token::In);
        send_response(
            &mut peer,
            &response(Token::In, 0, 2, TransferStatus::Success, 0, 5),
            &[],
        )
        .await;
        peer
    });

    assert_eq!(engine.submit(&setup).await, TransferStatus::Success);
    // The SETUP stage alone must not change the visible address.
    assert_eq!(device.address(), 0);

    let status_stage = Arc::new(Transfer::new(Token::In, 0, 2, vec![]));
    assert_eq!(engine.submit(&status_stage).await, TransferStatus::Success);
    assert_eq!(device.address(), 5);

    peer_task.await.unwrap();
}

#[tokio::test]
async fn deferred_address_update_follows_completion_delivery() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    // Shadow the address via a submitted SETUP.
    let setup = Arc::new(Transfer::new(
        Token::Setup,
        0,
        1,
        vec![0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00],
    ));
    let engine2 = engine.clone();
    let setup2 = setup.clone();
    let submit = tokio::spawn(async move { engine2.submit(&setup2).await });
    read_request(&mut peer).await;
    send_response(
        &mut peer,
        &response(Token::Setup, 0, 1, TransferStatus::Success, 8, 0),
        &[],
    )
    .await;
    assert_eq!(submit.await.unwrap(), TransferStatus::Success);

    // The status stage arrives with no matching inflight entry, so it
    // takes the completed-record path.
    device.add_live(Arc::new(Transfer::new(Token::In, 0, 3, vec![])));
    send_response(
        &mut peer,
        &response(Token::In, 0, 3, TransferStatus::Success, 0, 5),
        &[],
    )
    .await;

    settle().await;

    let events = device.events();
    let complete_pos = events.iter().position(|e| e == "complete 3").unwrap();
    let addr_pos = events.iter().position(|e| e == "set_address 5").unwrap();
    assert!(
        complete_pos < addr_pos,
        "address update must follow the completion: {:?}",
        events
    );
    assert_eq!(device.address(), 5);
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let (engine, device) = new_engine();

    // First connection: submit, then lose the peer.
    let mut peer1 = connect(&engine).await;
    let stale = Arc::new(Transfer::new(Token::In, 1, 11, vec![0; 8]));
    let engine2 = engine.clone();
    let stale2 = stale.clone();
    let submit = tokio::spawn(async move { engine2.submit(&stale2).await });
    read_request(&mut peer1).await;
    drop(peer1);
    assert_eq!(submit.await.unwrap(), TransferStatus::Stall);
    engine.wait_closed().await;
    assert!(!device.attached());

    // Second connection: a fresh submit succeeds, untouched by the first
    // connection's residue.
    let mut peer2 = connect(&engine).await;
    assert!(device.attached());

    let fresh = Arc::new(Transfer::new(Token::In, 1, 12, vec![0; 2]));
    let peer_task = tokio::spawn(async move {
        let (header, _) = read_request(&mut peer2).await;
        assert_eq!(header.id, 12);
        send_response(
            &mut peer2,
            &response(Token::In, 1, 12, TransferStatus::Success, 2, 0),
            &[7, 7],
        )
        .await;
        peer2
    });

    assert_eq!(engine.submit(&fresh).await, TransferStatus::Success);
    assert_eq!(fresh.buffer(), vec![7, 7]);
    peer_task.await.unwrap();
}

#[tokio::test]
async fn nak_on_queued_transfer_becomes_io_error() {
    let (engine, _device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(Token::In, 1, 4, vec![0; 8]));

    let peer_task = tokio::spawn(async move {
        read_request(&mut peer).await;
        send_response(
            &mut peer,
            &response(Token::In, 1, 4, TransferStatus::Nak, 0, 0),
            &[],
        )
        .await;
        peer
    });

    // NAK has no meaning for a queued transfer at this layer.
    assert_eq!(engine.submit(&transfer).await, TransferStatus::IoError);
    peer_task.await.unwrap();
}

#[tokio::test]
async fn nak_on_async_transfer_is_protocol_violation() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(Token::In, 1, 6, vec![0; 8]));
    transfer.set_state(TransferState::Async);
    device.add_live(transfer);

    send_response(
        &mut peer,
        &response(Token::In, 1, 6, TransferStatus::Nak, 0, 0),
        &[],
    )
    .await;

    engine.wait_closed().await;
    assert!(!device.attached());
}

#[tokio::test]
async fn remove_from_queue_routed_to_dispose() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    device.add_live(Arc::new(Transfer::new(Token::In, 2, 9, vec![0; 4])));

    send_response(
        &mut peer,
        &response(Token::In, 2, 9, TransferStatus::RemoveFromQueue, 0, 0),
        &[],
    )
    .await;

    settle().await;

    let events = device.events();
    assert!(events.contains(&"dispose 9".to_string()));
    assert!(!events.contains(&"complete 9".to_string()));
}

#[tokio::test]
async fn canceled_transfer_response_not_delivered() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    let transfer = Arc::new(Transfer::new(Token::In, 2, 8, vec![0; 4]));
    transfer.set_state(TransferState::Canceled);
    device.add_live(transfer);

    send_response(
        &mut peer,
        &response(Token::In, 2, 8, TransferStatus::Success, 0, 0),
        &[],
    )
    .await;

    settle().await;

    let events = device.events();
    assert!(!events.iter().any(|e| e.starts_with("complete")));
    assert!(engine.is_open());
}

#[tokio::test]
async fn reset_clears_shadow_address_and_notifies_peer() {
    let (engine, device) = new_engine();
    let mut peer = connect(&engine).await;

    // Shadow address 5 via a SET_ADDRESS SETUP.
    let setup = Arc::new(Transfer::new(
        Token::Setup,
        0,
        1,
        vec![0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00],
    ));
    let engine2 = engine.clone();
    let setup2 = setup.clone();
    let submit = tokio::spawn(async move { engine2.submit(&setup2).await });
    read_request(&mut peer).await;
    send_response(
        &mut peer,
        &response(Token::Setup, 0, 1, TransferStatus::Success, 8, 0),
        &[],
    )
    .await;
    submit.await.unwrap();

    engine.reset().await;

    let mut tag = [0u8; 1];
    peer.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], MessageType::Reset as u8);

    // The shadow was zeroed: a status-stage success no longer applies 5.
    let status_stage = Arc::new(Transfer::new(Token::In, 0, 2, vec![]));
    let peer_task = tokio::spawn(async move {
        read_request(&mut peer).await;
        send_response(
            &mut peer,
            &response(Token::In, 0, 2, TransferStatus::Success, 0, 0),
            &[],
        )
        .await;
        peer
    });
    assert_eq!(engine.submit(&status_stage).await, TransferStatus::Success);
    assert_eq!(device.address(), 0);

    peer_task.await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_engine() {
    let (engine, device) = new_engine();
    let _peer = connect(&engine).await;
    assert!(device.attached());

    engine.shutdown().await;

    assert!(!engine.is_open());
    assert!(!device.attached());

    // Further submits fail cleanly.
    let transfer = Arc::new(Transfer::new(Token::In, 1, 1, vec![]));
    assert_eq!(engine.submit(&transfer).await, TransferStatus::Stall);
}

#[tokio::test]
async fn attach_after_shutdown_is_rejected() {
    let (engine, device) = new_engine();
    let _peer = connect(&engine).await;

    engine.shutdown().await;

    let (local, _far) = tokio::io::duplex(1024);
    let result = engine.attach_stream(Box::new(local)).await;
    assert!(matches!(result, Err(BackendError::ShutDown)));
    assert!(!device.attached());
    assert!(!engine.is_open());
}

#[cfg(unix)]
#[tokio::test]
async fn serve_stops_after_shutdown() {
    use backend::{RemoteListener, Transport};

    let (engine, _device) = new_engine();

    let path = std::env::temp_dir().join(format!("remote-usb-serve-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = RemoteListener::bind(&Transport::Unix {
        path: Some(path.clone()),
    })
    .await
    .unwrap();

    let serve_task = tokio::spawn(listener.serve(engine.clone()));

    // Even when the stop fires before the acceptor reaches its select,
    // serve must notice it and return.
    engine.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), serve_task)
        .await
        .expect("acceptor did not stop")
        .unwrap();

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn stale_reader_cannot_close_next_connection() {
    let (engine, device) = new_engine();

    // First connection dies from a local write failure, so its peer side
    // (and therefore its reader's read side) stays alive.
    let (local, far) = tokio::io::duplex(64 * 1024);
    let write_dead = Arc::new(AtomicBool::new(false));
    engine
        .attach_stream(Box::new(FailingWriteLink {
            inner: local,
            write_dead: write_dead.clone(),
        }))
        .await
        .unwrap();

    write_dead.store(true, Ordering::Release);
    let stale = Arc::new(Transfer::new(Token::Out, 1, 1, vec![0; 4]));
    assert_eq!(engine.submit(&stale).await, TransferStatus::Stall);
    engine.wait_closed().await;
    assert!(!device.attached());

    let mut peer2 = connect(&engine).await;
    assert!(device.attached());

    // The first pipe dying now must not touch the second connection.
    drop(far);
    settle().await;
    assert!(engine.is_open());

    let fresh = Arc::new(Transfer::new(Token::In, 1, 2, vec![0; 2]));
    let peer_task = tokio::spawn(async move {
        let (header, _) = read_request(&mut peer2).await;
        send_response(
            &mut peer2,
            &response(Token::In, header.ep, header.id, TransferStatus::Success, 2, 0),
            &[5, 5],
        )
        .await;
    });
    assert_eq!(engine.submit(&fresh).await, TransferStatus::Success);
    peer_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_engine_always_has_a_usable_writer() {
    // A submit that observes the connection as open must find the write
    // half in place, however tightly it races the attach.
    for id in 0..20u64 {
        let (engine, _device) = new_engine();
        let (local, mut peer) = tokio::io::duplex(64 * 1024);

        let submitter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                while !engine.is_open() {
                    tokio::task::yield_now().await;
                }
                let transfer = Arc::new(Transfer::new(Token::In, 1, id, vec![0; 4]));
                engine.submit(&transfer).await
            })
        };

        engine.attach_stream(Box::new(local)).await.unwrap();

        let responder = tokio::spawn(async move {
            let (header, _) = read_request(&mut peer).await;
            send_response(
                &mut peer,
                &response(Token::In, header.ep, header.id, TransferStatus::Success, 4, 0),
                &[0; 4],
            )
            .await;
        });

        let status = tokio::time::timeout(Duration::from_secs(5), submitter)
            .await
            .expect("submit hung")
            .unwrap();
        assert_eq!(status, TransferStatus::Success);

        engine.shutdown().await;
        responder.abort();
    }
}
