//! Inflight transfer registry
//!
//! One entry per outstanding request, inserted by the sender immediately
//! before the bytes hit the wire and removed by the sender after the
//! resolved flag is observed set. Cancellation deliberately inserts a
//! second entry under the same key; `find` returns the oldest match, so
//! lookups keep resolving the original request first.

use crate::transfer::{Transfer, TransferKey};
use protocol::TransferStatus;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A pending request awaiting its response
#[derive(Debug)]
pub(crate) struct InflightEntry {
    key: TransferKey,
    transfer: Arc<Transfer>,
    /// Device address the consumer's device exposed at send time
    addr_at_send: u8,
    /// Address reported by the matching response
    reported_addr: AtomicU8,
    resolved: AtomicBool,
    notify: Notify,
}

impl InflightEntry {
    pub fn new(transfer: Arc<Transfer>, addr_at_send: u8) -> Arc<Self> {
        Arc::new(Self {
            key: transfer.key(),
            transfer,
            addr_at_send,
            reported_addr: AtomicU8::new(0),
            resolved: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn key(&self) -> TransferKey {
        self.key
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    pub fn addr_at_send(&self) -> u8 {
        self.addr_at_send
    }

    pub fn reported_addr(&self) -> u8 {
        self.reported_addr.load(Ordering::Acquire)
    }

    pub fn set_reported_addr(&self, addr: u8) {
        self.reported_addr.store(addr, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Set the one-shot resolved flag and wake every waiter
    ///
    /// The flag only ever transitions unset -> set; a second call (response
    /// racing forced closure) is a no-op apart from the redundant wake.
    pub fn resolve(&self) {
        self.resolved.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Wait until the resolved flag is set
    pub async fn wait_resolved(&self) {
        loop {
            if self.resolved.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            // Re-check: resolve() may have run between the load and the
            // waiter registration.
            if self.resolved.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Mutex-guarded collection of inflight entries
///
/// Traversal is linear; transfer counts per device are tens, not
/// thousands.
#[derive(Debug, Default)]
pub(crate) struct InflightRegistry {
    entries: Mutex<Vec<Arc<InflightEntry>>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<InflightEntry>) {
        self.entries
            .lock()
            .expect("inflight lock poisoned")
            .push(entry);
    }

    /// Remove a specific entry (not just any entry with the same key)
    pub fn remove(&self, entry: &Arc<InflightEntry>) {
        self.entries
            .lock()
            .expect("inflight lock poisoned")
            .retain(|e| !Arc::ptr_eq(e, entry));
    }

    /// Find the oldest entry matching (token, endpoint, id)
    pub fn find(&self, key: TransferKey) -> Option<Arc<InflightEntry>> {
        self.entries
            .lock()
            .expect("inflight lock poisoned")
            .iter()
            .find(|e| e.key() == key)
            .cloned()
    }

    /// Force-resolve every entry with the given status
    ///
    /// Used on connection closure so no submit call blocks past it. The
    /// entries themselves are removed later by their blocked senders.
    pub fn resolve_all(&self, status: TransferStatus) {
        let entries = self.entries.lock().expect("inflight lock poisoned");
        for entry in entries.iter() {
            entry.transfer().set_status(status);
            entry.resolve();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("inflight lock poisoned").len()
    }
}
