//! Consumer-facing traits
//!
//! The engine routes transfers; the host framework owns the device model.
//! [`RemoteDevice`] is the seam between the two: the engine calls in for
//! completions, lifecycle changes and fallback transfer lookup, and reads
//! or writes the currently-effective device address through it.

use crate::transfer::Transfer;
use protocol::Token;
use std::sync::Arc;

/// The host framework's view of the tunneled USB device
///
/// `complete` and `dispose` are only ever invoked from the engine's
/// deferred-task context, never from the reader task. `set_address` is
/// invoked either from a submitting task (endpoint-0 IN status stage) or
/// from the deferred-task context.
pub trait RemoteDevice: Send + Sync + 'static {
    /// Currently-effective device address
    fn address(&self) -> u8;

    /// Apply a new device address
    fn set_address(&self, addr: u8);

    /// Whether the device is currently attached to its port
    fn attached(&self) -> bool;

    /// A peer connected; attach the device to its port
    fn on_attach(&self);

    /// The connection went away; detach the device from its port
    fn on_detach(&self);

    /// Fallback lookup for a live transfer by (token, endpoint, id)
    ///
    /// Used by the reader when a response matches no inflight entry,
    /// covering a response racing an already-removed entry.
    fn find_transfer(&self, token: Token, ep: u8, id: u64) -> Option<Arc<Transfer>>;

    /// Hand a finished transfer back through the normal completion path
    fn complete(&self, transfer: Arc<Transfer>);

    /// Detach a transfer from its queue without normal completion
    fn dispose(&self, transfer: Arc<Transfer>);
}

/// Opaque block/unblock of live relocation while a peer is attached
///
/// The engine engages the blocker when a connection is accepted and
/// releases it during deferred cleanup. What "relocation" means is the
/// embedder's business.
pub trait RelocationBlocker: Send + Sync + 'static {
    fn block(&self);
    fn unblock(&self);
}

/// Blocker that does nothing, for embedders without live relocation
#[derive(Debug, Default)]
pub struct NullRelocationBlocker;

impl RelocationBlocker for NullRelocationBlocker {
    fn block(&self) {}
    fn unblock(&self) {}
}
