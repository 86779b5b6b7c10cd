//! Completion dispatch
//!
//! Responses that match no inflight entry (the entry was already removed,
//! typically by a cancel race) still belong to a transfer the consumer
//! knows by id. The reader pushes them here and schedules the deferred
//! task; delivery to the consumer happens strictly in FIFO arrival order,
//! on the engine's deferred-task context rather than the reader task.

use crate::transfer::Transfer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A finished transfer awaiting hand-off to the consumer
#[derive(Debug)]
pub(crate) struct CompletedRecord {
    pub transfer: Arc<Transfer>,
    /// Device address reported in the response
    pub addr: u8,
}

/// Work items executed on the deferred-task context
///
/// Scheduling is FIFO; the address-update ordering guarantee (new address
/// visible only after the status-stage completion was delivered) relies
/// on that.
#[derive(Debug)]
pub(crate) enum DeferredTask {
    /// Drain the completed queue and hand records to the consumer
    Completed,
    /// Apply the shadow address to the consumer's device
    UpdateAddress,
    /// Tear the closed connection down (off the reader task)
    Cleanup,
}

/// FIFO queue of completed records, one lock
#[derive(Debug, Default)]
pub(crate) struct CompletionQueue {
    records: Mutex<VecDeque<CompletedRecord>>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: CompletedRecord) {
        self.records
            .lock()
            .expect("completed lock poisoned")
            .push_back(record);
    }

    pub fn pop(&self) -> Option<CompletedRecord> {
        self.records
            .lock()
            .expect("completed lock poisoned")
            .pop_front()
    }

    /// Take everything at once (flush paths: reset, cleanup)
    pub fn drain(&self) -> Vec<CompletedRecord> {
        self.records
            .lock()
            .expect("completed lock poisoned")
            .drain(..)
            .collect()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .expect("completed lock poisoned")
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Token;

    fn record(id: u64) -> CompletedRecord {
        CompletedRecord {
            transfer: Arc::new(Transfer::new(Token::In, 1, id, vec![])),
            addr: 0,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = CompletionQueue::new();
        queue.push(record(1));
        queue.push(record(2));
        queue.push(record(3));

        assert_eq!(queue.pop().unwrap().transfer.id(), 1);
        assert_eq!(queue.pop().unwrap().transfer.id(), 2);
        assert_eq!(queue.pop().unwrap().transfer.id(), 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drain_empties() {
        let queue = CompletionQueue::new();
        queue.push(record(1));
        queue.push(record(2));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
