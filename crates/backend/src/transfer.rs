//! Transfer data model
//!
//! A [`Transfer`] is owned by the consumer (the host USB stack); the engine
//! holds non-owning `Arc` references while the transfer is inflight. The
//! identity (token, endpoint, id) is immutable; the buffer, transferred
//! count, status and state are shared between the submitting task and the
//! reader task and live behind a mutex.

use protocol::{Token, TransferStatus};
use std::sync::Mutex;

/// Identity of one in-progress transfer on a connection
///
/// (token, endpoint, id) uniquely identifies a transfer at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub token: Token,
    pub ep: u8,
    pub id: u64,
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Waiting on its queue, not yet dispatched asynchronously
    Queued,
    /// Dispatched asynchronously; completion arrives later
    Async,
    /// Canceled by the consumer
    Canceled,
}

#[derive(Debug)]
struct TransferInner {
    /// Payload buffer for the whole transfer
    buffer: Vec<u8>,
    /// Running transferred-byte count
    actual: usize,
    status: TransferStatus,
    state: TransferState,
}

/// One USB transfer request
#[derive(Debug)]
pub struct Transfer {
    token: Token,
    ep: u8,
    stream: u16,
    id: u64,
    short_not_ok: bool,
    int_req: bool,
    inner: Mutex<TransferInner>,
}

impl Transfer {
    /// Create a new queued transfer
    ///
    /// For OUT/SETUP the buffer holds the bytes to send; for IN it is the
    /// destination sized to the requested length.
    pub fn new(token: Token, ep: u8, id: u64, buffer: Vec<u8>) -> Self {
        Self {
            token,
            ep,
            stream: 0,
            id,
            short_not_ok: false,
            int_req: false,
            inner: Mutex::new(TransferInner {
                buffer,
                actual: 0,
                status: TransferStatus::Success,
                state: TransferState::Queued,
            }),
        }
    }

    /// Set the bulk stream id
    pub fn with_stream(mut self, stream: u16) -> Self {
        self.stream = stream;
        self
    }

    /// Set the short-not-ok / interrupt-requested flags
    pub fn with_flags(mut self, short_not_ok: bool, int_req: bool) -> Self {
        self.short_not_ok = short_not_ok;
        self.int_req = int_req;
        self
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn ep(&self) -> u8 {
        self.ep
    }

    pub fn stream(&self) -> u16 {
        self.stream
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn short_not_ok(&self) -> bool {
        self.short_not_ok
    }

    pub fn int_req(&self) -> bool {
        self.int_req
    }

    pub fn key(&self) -> TransferKey {
        TransferKey {
            token: self.token,
            ep: self.ep,
            id: self.id,
        }
    }

    /// Remaining untransferred byte count
    pub fn remaining(&self) -> usize {
        let inner = self.inner.lock().expect("transfer lock poisoned");
        inner.buffer.len() - inner.actual
    }

    /// Transferred-byte count so far
    pub fn actual(&self) -> usize {
        self.inner.lock().expect("transfer lock poisoned").actual
    }

    /// Copy the next `len` untransferred bytes out of the buffer without
    /// advancing the transferred count
    ///
    /// The bytes are provisionally in flight once sent; the count only
    /// advances when the peer confirms them in its response.
    pub fn copy_out(&self, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().expect("transfer lock poisoned");
        let end = (inner.actual + len).min(inner.buffer.len());
        inner.buffer[inner.actual..end].to_vec()
    }

    /// Copy response bytes into the buffer at the current offset and
    /// advance the transferred count
    ///
    /// Returns the number of bytes actually copied; excess input beyond
    /// the buffer is discarded.
    pub fn copy_in(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock().expect("transfer lock poisoned");
        let offset = inner.actual;
        let n = data.len().min(inner.buffer.len() - offset);
        inner.buffer[offset..offset + n].copy_from_slice(&data[..n]);
        inner.actual += n;
        n
    }

    /// Advance the transferred count by `n` confirmed bytes (OUT path)
    pub fn add_actual(&self, n: usize) {
        let mut inner = self.inner.lock().expect("transfer lock poisoned");
        inner.actual = (inner.actual + n).min(inner.buffer.len());
    }

    /// Snapshot the buffer contents (test and consumer convenience)
    pub fn buffer(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("transfer lock poisoned")
            .buffer
            .clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.lock().expect("transfer lock poisoned").status
    }

    pub fn set_status(&self, status: TransferStatus) {
        self.inner.lock().expect("transfer lock poisoned").status = status;
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().expect("transfer lock poisoned").state
    }

    pub fn set_state(&self, state: TransferState) {
        self.inner.lock().expect("transfer lock poisoned").state = state;
    }

    /// True while the transfer still belongs to a queue (queued or async)
    pub fn is_inflight(&self) -> bool {
        matches!(self.state(), TransferState::Queued | TransferState::Async)
    }
}
