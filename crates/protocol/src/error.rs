//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Unknown message type tag on the wire
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Unknown USB token value on the wire
    #[error("Unknown USB token: {0:#04x}")]
    UnknownToken(u8),

    /// Unknown transfer status value on the wire
    #[error("Unknown transfer status: {0}")]
    UnknownStatus(i32),

    /// Announced payload length exceeds the safety ceiling
    #[error("Payload too large: {length} bytes (max: {max})")]
    PayloadTooLarge { length: u32, max: u32 },

    /// I/O error while encoding or decoding
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::PayloadTooLarge {
            length: 100_000,
            max: 65536,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Payload too large"));
        assert!(msg.contains("100000"));
    }

    #[test]
    fn test_unknown_type_display() {
        let err = ProtocolError::UnknownMessageType(0x7f);
        assert!(format!("{}", err).contains("0x7f"));
    }
}
