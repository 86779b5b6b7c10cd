//! Wire protocol for remote-usb
//!
//! This crate defines the byte-stream protocol spoken between the device
//! backend and the remote peer serving the device. The format is a fixed,
//! flat binary layout: a 1-byte type tag, a type-specific body, and an
//! optional raw payload. It carries USB transfer requests, their
//! completions, cancellations, and bus resets, nothing else. USB
//! descriptor parsing and class semantics live with the peer.
//!
//! # Example
//!
//! ```
//! use protocol::{RequestHeader, Token, encode_request};
//!
//! let header = RequestHeader {
//!     addr: 0,
//!     token: Token::In,
//!     ep: 1,
//!     stream: 0,
//!     id: 7,
//!     short_not_ok: false,
//!     int_req: true,
//!     length: 0,
//! };
//! let bytes = encode_request(&header, &[]).unwrap();
//! assert_eq!(bytes.len(), 1 + RequestHeader::SIZE);
//! ```

pub mod error;
pub mod types;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use types::{Token, TransferStatus, USB_REQ_SET_ADDRESS, parse_set_address};
pub use wire::{
    CancelHeader, MAX_PAYLOAD, MessageType, RequestHeader, ResponseHeader, encode_cancel,
    encode_request, encode_reset,
};
