//! Backend error types

use protocol::{MessageType, ProtocolError, Token, TransferStatus};
use thiserror::Error;

/// Errors raised by the protocol engine
///
/// Every variant except `ShutDown` and `AlreadyConnected` is fatal to the
/// connection: the reader tears the link down and force-resolves all
/// inflight transfers with `Stall`.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Codec-level failure (unknown tag/token/status, oversized payload)
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer sent a message type that is never legal inbound
    #[error("Unexpected inbound message type: {0:?}")]
    UnexpectedMessage(MessageType),

    /// The peer re-resolved an asynchronously-dispatched transfer with
    /// NAK or pending-async
    #[error(
        "Transfer {token:?} ep {ep} id {id:#x} is already async, cannot apply {status:?}"
    )]
    AsyncReResolved {
        token: Token,
        ep: u8,
        id: u64,
        status: TransferStatus,
    },

    /// The engine has been shut down and accepts no new connections
    #[error("Engine is shut down")]
    ShutDown,

    /// A peer is already connected
    #[error("A peer is already connected")]
    AlreadyConnected,

    /// Transport-level I/O failure
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for backend results
pub type Result<T> = std::result::Result<T, BackendError>;
