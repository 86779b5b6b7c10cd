//! Protocol engine: request sender, reader loop, connection lifecycle
//!
//! One [`RemoteBackend`] serves one tunneled device. A connection moves
//! through `Closed -> Open -> ClosingCleanup -> Closed`; while open, a
//! dedicated reader task drains the socket and resolves inflight entries,
//! and any number of submitting tasks write requests under the send lock
//! and park until resolution.
//!
//! Deferred work (completion delivery, address updates, connection
//! cleanup) runs on the engine's deferred-task context, never on the
//! reader task, because it touches consumer-owned state. Submitting tasks
//! must not hold consumer-wide locks across `submit`/`cancel`, or the
//! reader and the deferred task can be starved of them.

use crate::completion::{CompletedRecord, CompletionQueue, DeferredTask};
use crate::device::{RelocationBlocker, RemoteDevice};
use crate::error::{BackendError, Result};
use crate::inflight::{InflightEntry, InflightRegistry};
use crate::transfer::{Transfer, TransferKey, TransferState};
use protocol::{
    MessageType, RequestHeader, ResponseHeader, Token, TransferStatus, encode_cancel,
    encode_request, encode_reset, parse_set_address,
};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

/// How long a cancel waits for its acknowledgment
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte stream carrying the protocol (TCP, Unix socket, in-memory pipe)
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

type LinkReader = tokio::io::ReadHalf<Box<dyn Link>>;
type LinkWriter = tokio::io::WriteHalf<Box<dyn Link>>;

/// Connection lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No peer (never opened, or cleanup finished)
    Closed = 0,
    /// Peer connected, reader running
    Open = 1,
    /// Torn down, awaiting deferred cleanup
    ClosingCleanup = 2,
}

/// Engine tunneling one USB device's transfers to a remote peer
pub struct RemoteBackend {
    device: Arc<dyn RemoteDevice>,
    blocker: Arc<dyn RelocationBlocker>,
    inflight: InflightRegistry,
    completed: CompletionQueue,
    /// Schedules work onto the deferred-task context (FIFO)
    tasks: async_channel::Sender<DeferredTask>,
    /// Send lock: one message is written as one unit
    link: Mutex<Option<LinkWriter>>,
    /// Reader task of the live connection, joined during cleanup
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    phase: AtomicU8,
    /// Address value believed current on the remote side; distinct from
    /// the address the consumer's device currently exposes
    shadow_addr: AtomicU8,
    /// Signals phase returning to `Closed` (acceptor wakeup)
    closed_notify: Notify,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl RemoteBackend {
    /// Create the engine and start its deferred-task context
    pub fn new(
        device: Arc<dyn RemoteDevice>,
        blocker: Arc<dyn RelocationBlocker>,
    ) -> Arc<Self> {
        let (tasks, task_rx) = async_channel::unbounded();

        let engine = Arc::new(Self {
            device,
            blocker,
            inflight: InflightRegistry::new(),
            completed: CompletionQueue::new(),
            tasks,
            link: Mutex::new(None),
            reader: Mutex::new(None),
            phase: AtomicU8::new(Phase::Closed as u8),
            shadow_addr: AtomicU8::new(0),
            closed_notify: Notify::new(),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        });

        tokio::spawn(engine.clone().run_deferred(task_rx));

        engine
    }

    fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            1 => Phase::Open,
            2 => Phase::ClosingCleanup,
            _ => Phase::Closed,
        }
    }

    /// Whether a peer is currently connected
    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) async fn stop_requested(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let notified = self.stop_notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Adopt a freshly accepted stream: engage the relocation blocker,
    /// attach the device, start the reader
    ///
    /// Rejected once `shutdown` has run.
    pub async fn attach_stream(self: &Arc<Self>, stream: Box<dyn Link>) -> Result<()> {
        let (read_half, write_half) = tokio::io::split(stream);

        {
            // The writer must be in place before `Open` is observable:
            // a submit that sees `Open` blocks on this lock and has to
            // find the write half here.
            let mut link = self.link.lock().await;

            if self.is_stopped() {
                return Err(BackendError::ShutDown);
            }

            if self
                .phase
                .compare_exchange(
                    Phase::Closed as u8,
                    Phase::Open as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return Err(BackendError::AlreadyConnected);
            }

            *link = Some(write_half);
        }

        self.blocker.block();

        if !self.device.attached() {
            self.device.on_attach();
        }

        info!("Peer connected");

        // Hold the slot across the spawn so cleanup always finds the
        // handle, even when the reader fails immediately.
        let mut reader = self.reader.lock().await;
        let engine = self.clone();
        *reader = Some(tokio::spawn(engine.run_reader(read_half)));

        Ok(())
    }

    /// Park until the connection has fully returned to `Closed`
    pub async fn wait_closed(&self) {
        loop {
            if self.phase() == Phase::Closed {
                return;
            }
            let notified = self.closed_notify.notified();
            if self.phase() == Phase::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Submit a transfer and park until it resolves
    ///
    /// Returns the final status; the same value is stored on the transfer.
    /// The inflight entry is removed before returning; entries never leak
    /// past resolution.
    pub async fn submit(&self, transfer: &Arc<Transfer>) -> TransferStatus {
        if self.phase() != Phase::Open {
            transfer.set_status(TransferStatus::Stall);
            return TransferStatus::Stall;
        }

        let length = transfer.remaining() as u32;
        let wire_addr = self.shadow_addr.load(Ordering::Acquire);

        let mut payload = Vec::new();
        if transfer.token().is_outbound() && length > 0 {
            // The bytes are provisionally in flight; the transferred count
            // only advances when the peer confirms them.
            payload = transfer.copy_out(length as usize);

            if transfer.token() == Token::Setup && transfer.ep() == 0 {
                if let Some(addr) = parse_set_address(&payload) {
                    // The new address takes effect only after the status
                    // stage of this control transfer succeeds; until then
                    // it is only shadowed.
                    self.shadow_addr.store(addr, Ordering::Release);
                    debug!(addr, "SET_ADDRESS observed, shadowing");
                }
            }
        }

        let header = RequestHeader {
            addr: wire_addr,
            token: transfer.token(),
            ep: transfer.ep(),
            stream: transfer.stream(),
            id: transfer.id(),
            short_not_ok: transfer.short_not_ok(),
            int_req: transfer.int_req(),
            length,
        };

        trace!(
            token = ?header.token,
            ep = header.ep,
            id = header.id,
            length = header.length,
            "Submitting request"
        );

        let entry = InflightEntry::new(transfer.clone(), self.device.address());
        self.inflight.insert(entry.clone());

        let mut write_ok = false;
        match encode_request(&header, &payload) {
            Ok(message) => {
                let mut link = self.link.lock().await;
                match link.as_mut() {
                    Some(writer) => {
                        if writer.write_all(&message).await.is_ok() {
                            write_ok = true;
                        } else {
                            transfer.set_status(TransferStatus::Stall);
                            drop(link);
                            self.mark_closed();
                        }
                    }
                    None => transfer.set_status(TransferStatus::Stall),
                }
            }
            Err(e) => {
                warn!("Failed to encode request: {}", e);
                transfer.set_status(TransferStatus::Stall);
            }
        }

        if write_ok {
            entry.wait_resolved().await;
            trace!(
                id = transfer.id(),
                status = ?transfer.status(),
                addr_at_send = entry.addr_at_send(),
                reported_addr = entry.reported_addr(),
                "Request resolved"
            );
        }

        // The one legal point where a shadowed address becomes visible:
        // the status stage (endpoint-0 IN) completed successfully.
        let shadow = self.shadow_addr.load(Ordering::Acquire);
        if shadow != self.device.address()
            && transfer.ep() == 0
            && transfer.token() == Token::In
            && transfer.status() == TransferStatus::Success
        {
            self.device.set_address(shadow);
        }

        self.inflight.remove(&entry);

        transfer.status()
    }

    /// Cancel a transfer, best-effort
    ///
    /// Registers a second inflight entry under the transfer's key to learn
    /// the acknowledgment, waits up to one second, then abandons the wait.
    /// No status is surfaced; a late acknowledgment falls through to the
    /// completed-record path and is dropped there as canceled.
    ///
    /// Transfers the consumer resolves through a combined-packet mechanism
    /// of its own must not be routed here.
    pub async fn cancel(&self, transfer: &Arc<Transfer>) {
        if self.phase() != Phase::Open {
            return;
        }

        let header = protocol::CancelHeader {
            addr: self.shadow_addr.load(Ordering::Acquire),
            token: transfer.token(),
            ep: transfer.ep(),
            id: transfer.id(),
        };

        debug!(token = ?header.token, ep = header.ep, id = header.id, "Canceling transfer");

        let entry = InflightEntry::new(transfer.clone(), self.device.address());
        self.inflight.insert(entry.clone());

        match encode_cancel(&header) {
            Ok(message) => {
                let mut link = self.link.lock().await;
                if let Some(writer) = link.as_mut() {
                    if writer.write_all(&message).await.is_err() {
                        drop(link);
                        self.mark_closed();
                    }
                }
            }
            Err(e) => warn!("Failed to encode cancel: {}", e),
        }

        if tokio::time::timeout(CANCEL_TIMEOUT, entry.wait_resolved())
            .await
            .is_err()
        {
            debug!(id = transfer.id(), "Cancel acknowledgment timed out");
        }

        self.inflight.remove(&entry);
    }

    /// Reset the connection state and tell the peer, best-effort
    ///
    /// Flushes the inflight and completed collections (stalling anything
    /// pending), zeroes the shadow address, and sends a `RESET` message
    /// without awaiting an acknowledgment.
    pub async fn reset(&self) {
        if self.phase() != Phase::Open {
            return;
        }

        debug!("Resetting connection state");
        self.inflight.resolve_all(TransferStatus::Stall);
        self.flush_completed();
        self.shadow_addr.store(0, Ordering::Release);

        match encode_reset() {
            Ok(message) => {
                let mut link = self.link.lock().await;
                if let Some(writer) = link.as_mut() {
                    if writer.write_all(&message).await.is_err() {
                        drop(link);
                        self.mark_closed();
                    }
                }
            }
            Err(e) => warn!("Failed to encode reset: {}", e),
        }
    }

    /// Tear everything down: close the live connection, stop the acceptor,
    /// stop the deferred-task context once cleanup has drained
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.stopped.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();

        // Serialize with attach_stream: once the lock turns over, any
        // later attach observes the stop flag, and any attach that won
        // the race is visible in the phase below and torn down here.
        drop(self.link.lock().await);

        if self.phase() != Phase::Closed {
            self.mark_closed();
            self.wait_closed().await;
        }

        self.tasks.close();
    }

    /// `Open -> ClosingCleanup`: force-resolve all inflight entries so
    /// blocked senders wake, then schedule deferred cleanup
    ///
    /// Cleanup must not run on the reader task; it touches consumer-owned
    /// state the reader must not mutate.
    fn mark_closed(&self) {
        if self
            .phase
            .compare_exchange(
                Phase::Open as u8,
                Phase::ClosingCleanup as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        info!("Connection closed");
        self.inflight.resolve_all(TransferStatus::Stall);
        let _ = self.tasks.try_send(DeferredTask::Cleanup);
    }

    /// Reader loop: one per live connection, exits on close or violation
    async fn run_reader(self: Arc<Self>, mut reader: LinkReader) {
        debug!("Reader started");

        loop {
            if self.phase() != Phase::Open {
                break;
            }
            if let Err(e) = self.read_one(&mut reader).await {
                match &e {
                    BackendError::Io(_) => debug!("Connection lost: {}", e),
                    _ => warn!("Closing connection: {}", e),
                }
                self.mark_closed();
                break;
            }
        }

        debug!("Reader stopped");
    }

    /// Decode and apply one inbound message
    async fn read_one(&self, reader: &mut LinkReader) -> Result<()> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag).await?;

        // Only RESPONSE is legal inbound.
        match MessageType::from_u8(tag[0])? {
            MessageType::Response => {}
            other => return Err(BackendError::UnexpectedMessage(other)),
        }

        let mut body = [0u8; ResponseHeader::SIZE];
        reader.read_exact(&mut body).await?;
        // Oversized announced lengths are rejected here, before any copy.
        let rhdr = ResponseHeader::read_from(&mut Cursor::new(&body[..]))?;

        let key = TransferKey {
            token: rhdr.token,
            ep: rhdr.ep,
            id: rhdr.id,
        };
        let entry = self.inflight.find(key);
        let transfer = entry
            .as_ref()
            .map(|e| e.transfer().clone())
            .or_else(|| self.device.find_transfer(rhdr.token, rhdr.ep, rhdr.id));

        trace!(
            token = ?rhdr.token,
            ep = rhdr.ep,
            id = rhdr.id,
            status = ?rhdr.status,
            length = rhdr.length,
            "Received response"
        );

        if transfer.is_none() {
            // Likely canceled: when an endpoint is aborted, all of its
            // queued transfers are removed.
            warn!(
                token = ?rhdr.token,
                ep = rhdr.ep,
                id = rhdr.id,
                "Response matches no known transfer"
            );
        }

        if rhdr.has_payload() {
            if rhdr.token == Token::In {
                let mut payload = vec![0u8; rhdr.length as usize];
                reader.read_exact(&mut payload).await?;
                if let Some(transfer) = &transfer {
                    transfer.copy_in(&payload);
                }
            } else if let Some(transfer) = &transfer {
                // OUT: the bytes went over the wire with the request; the
                // response only confirms how many the peer consumed.
                transfer.add_actual(rhdr.length as usize);
            }
        }

        let Some(transfer) = transfer else {
            return Ok(());
        };

        transfer.set_status(rhdr.status);

        let mut cancelled = false;
        match transfer.state() {
            TransferState::Async => {
                if matches!(rhdr.status, TransferStatus::Nak | TransferStatus::Async) {
                    return Err(BackendError::AsyncReResolved {
                        token: rhdr.token,
                        ep: rhdr.ep,
                        id: rhdr.id,
                        status: rhdr.status,
                    });
                }
            }
            TransferState::Queued => {
                // NAK has no meaning once queued at this layer.
                if rhdr.status == TransferStatus::Nak {
                    transfer.set_status(TransferStatus::IoError);
                }
            }
            TransferState::Canceled => cancelled = true,
        }

        // An aborted endpoint-0 control transfer leaves the shadow address
        // unreliable; resynchronize from the live device.
        let status = transfer.status();
        let hard_failure = !matches!(
            status,
            TransferStatus::Success | TransferStatus::Async | TransferStatus::Nak
        );
        if (hard_failure || cancelled) && transfer.ep() == 0 && rhdr.token == Token::In {
            self.shadow_addr
                .store(self.device.address(), Ordering::Release);
        }

        if let Some(entry) = entry {
            entry.set_reported_addr(rhdr.addr);
            entry.resolve();
        } else if status != TransferStatus::Async && !cancelled {
            // The matching entry is gone but the transfer is still live;
            // deliver on the deferred context, in FIFO arrival order.
            self.completed.push(CompletedRecord {
                transfer,
                addr: rhdr.addr,
            });
            let _ = self.tasks.try_send(DeferredTask::Completed);
        }

        Ok(())
    }

    /// Deferred-task context: executes completion delivery, address
    /// updates and cleanup strictly in scheduling order
    async fn run_deferred(self: Arc<Self>, tasks: async_channel::Receiver<DeferredTask>) {
        while let Ok(task) = tasks.recv().await {
            match task {
                DeferredTask::Completed => self.deliver_completed(),
                DeferredTask::UpdateAddress => {
                    let addr = self.shadow_addr.load(Ordering::Acquire);
                    self.device.set_address(addr);
                    debug!(addr, "Applied device address");
                }
                DeferredTask::Cleanup => self.cleanup().await,
            }
        }
        debug!("Deferred-task context stopped");
    }

    /// Hand completed records to the consumer in FIFO order
    fn deliver_completed(&self) {
        while let Some(record) = self.completed.pop() {
            let transfer = &record.transfer;
            trace!(
                id = transfer.id(),
                reported_addr = record.addr,
                "Delivering completed record"
            );

            if self.shadow_addr.load(Ordering::Acquire) != self.device.address()
                && transfer.ep() == 0
                && transfer.token() == Token::In
                && transfer.status() == TransferStatus::Success
            {
                // Scheduled behind the current task, so the address update
                // is observed strictly after this record's delivery.
                let _ = self.tasks.try_send(DeferredTask::UpdateAddress);
            }

            if transfer.is_inflight() {
                self.deliver(record.transfer.clone());
            }
        }
    }

    /// Route one transfer to the consumer's completion or disposal path
    fn deliver(&self, transfer: Arc<Transfer>) {
        if transfer.status() == TransferStatus::RemoveFromQueue {
            self.device.dispose(transfer);
        } else {
            self.device.complete(transfer);
        }
    }

    /// Drain the completed queue, stalling anything still inflight
    fn flush_completed(&self) {
        for record in self.completed.drain() {
            if record.transfer.is_inflight() {
                record.transfer.set_status(TransferStatus::Stall);
                self.deliver(record.transfer);
            }
        }
    }

    /// `ClosingCleanup -> Closed`: runs on the deferred context
    async fn cleanup(&self) {
        // Join the reader first: a parked reader from this connection
        // must not survive into the next one and tear it down when its
        // read finally errors.
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        // Dropping the write half releases the socket.
        self.link.lock().await.take();

        self.flush_completed();

        if self.device.attached() {
            self.device.on_detach();
        }

        self.shadow_addr.store(0, Ordering::Release);
        self.blocker.unblock();

        self.phase.store(Phase::Closed as u8, Ordering::Release);
        self.closed_notify.notify_waiters();
        debug!("Cleanup finished, ready for a new peer");
    }
}
