//! Remote USB device backend
//!
//! Tunnels USB transfer requests and their completions between a local
//! device stack and a remote peer over a byte stream (TCP or a Unix
//! socket), so a virtualized or emulated USB device can be served by a
//! process running elsewhere.
//!
//! The heart of the crate is [`RemoteBackend`], a bidirectional,
//! multiplexed request/response matcher: submitting tasks write requests
//! under a send lock and park until a per-connection reader task matches
//! the peer's response back to them, while USB's strict per-transfer
//! ordering and status semantics are preserved without a central
//! sequencer. The host framework plugs in through the [`RemoteDevice`]
//! trait and drives transfers with [`RemoteBackend::submit`],
//! [`RemoteBackend::cancel`] and [`RemoteBackend::reset`];
//! [`RemoteListener`] supplies the accept/reconnect loop.

mod completion;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
mod inflight;
pub mod listener;
pub mod transfer;

pub use config::{BackendConfig, DEFAULT_SOCKET_PATH, Transport};
pub use connection::{Link, RemoteBackend};
pub use device::{NullRelocationBlocker, RelocationBlocker, RemoteDevice};
pub use error::{BackendError, Result};
pub use listener::RemoteListener;
pub use transfer::{Transfer, TransferKey, TransferState};
