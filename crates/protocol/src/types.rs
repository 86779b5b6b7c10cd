//! Wire-level USB type definitions
//!
//! Token and status values are a fixed numeric contract with the peer;
//! they are agreed out of band and never negotiated.

use crate::error::{ProtocolError, Result};

/// USB token (transfer direction / phase), on-wire PID values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Control SETUP stage
    Setup = 0x2d,
    /// Device-to-host
    In = 0x69,
    /// Host-to-device
    Out = 0xe1,
}

impl Token {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x2d => Ok(Self::Setup),
            0x69 => Ok(Self::In),
            0xe1 => Ok(Self::Out),
            _ => Err(ProtocolError::UnknownToken(value)),
        }
    }

    /// True for tokens that carry host-to-device payload (OUT and SETUP)
    pub fn is_outbound(self) -> bool {
        !matches!(self, Self::In)
    }
}

/// Result status of a USB transfer
///
/// Signed enumeration shared with the peer. `Success` is zero, everything
/// else is negative, matching the host framework's transfer-result codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer completed normally
    Success = 0,
    /// Device no longer present
    NoDevice = -1,
    /// Endpoint not ready; retry later
    Nak = -2,
    /// Endpoint halted
    Stall = -3,
    /// Device transmitted more than requested
    Babble = -4,
    /// Generic I/O failure
    IoError = -5,
    /// Completion will arrive asynchronously
    Async = -6,
    /// Queue the transfer behind the preceding one
    AddToQueue = -7,
    /// Detach the transfer from its queue without normal completion
    RemoveFromQueue = -8,
}

impl TransferStatus {
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Success),
            -1 => Ok(Self::NoDevice),
            -2 => Ok(Self::Nak),
            -3 => Ok(Self::Stall),
            -4 => Ok(Self::Babble),
            -5 => Ok(Self::IoError),
            -6 => Ok(Self::Async),
            -7 => Ok(Self::AddToQueue),
            -8 => Ok(Self::RemoveFromQueue),
            _ => Err(ProtocolError::UnknownStatus(value)),
        }
    }

    /// True for statuses that never carry a response payload
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Async)
    }
}

/// Standard SET_ADDRESS request number (USB 2.0 §9.4)
pub const USB_REQ_SET_ADDRESS: u8 = 5;

/// Parse the first 8 bytes of a SETUP payload and return the requested
/// address if the packet is a standard SET_ADDRESS request.
///
/// Setup packet layout: [bmRequestType, bRequest, wValue_lo, wValue_hi,
/// wIndex_lo, wIndex_hi, wLength_lo, wLength_hi], wValue little-endian.
pub fn parse_set_address(setup: &[u8]) -> Option<u8> {
    if setup.len() < 8 {
        return None;
    }
    if setup[0] == 0 && setup[1] == USB_REQ_SET_ADDRESS {
        Some(u16::from_le_bytes([setup[2], setup[3]]) as u8)
    } else {
        None
    }
}
