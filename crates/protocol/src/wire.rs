//! Wire message encoding and decoding
//!
//! Every message is a 1-byte type tag followed by a fixed-layout body and,
//! for some types, a raw payload:
//!
//! - `REQUEST`: body + payload bytes when the token is OUT/SETUP and the
//!   announced length is nonzero
//! - `RESPONSE`: body + payload bytes when the announced length is nonzero
//!   and the status is not `Async`
//! - `CANCEL`: body only
//! - `RESET`: tag only
//!
//! All integers are big-endian (network byte order). Messages are
//! transmitted and received in whole units; partial-read retry is handled
//! by the transport (`read_exact`/`write_all`).

use crate::error::{ProtocolError, Result};
use crate::types::{Token, TransferStatus};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Safety ceiling for announced payload lengths (64 KiB)
///
/// A peer announcing more than this is violating the protocol and the
/// connection must be closed.
pub const MAX_PAYLOAD: u32 = 65536;

/// Message type tag, the first byte of every message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Outbound transfer request (host -> peer)
    Request = 0,
    /// Transfer completion (peer -> host)
    Response = 1,
    /// Bus reset notification (host -> peer, unacknowledged)
    Reset = 2,
    /// Transfer cancellation (host -> peer)
    Cancel = 3,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Reset),
            3 => Ok(Self::Cancel),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }

    /// Read a type tag from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Self::from_u8(reader.read_u8()?)
    }

    /// Write the type tag to a writer
    pub fn write_to<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_u8(self as u8)?;
        Ok(())
    }
}

/// `REQUEST` body (19 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Device address believed current on the remote side
    pub addr: u8,
    /// USB token
    pub token: Token,
    /// Endpoint number
    pub ep: u8,
    /// Stream id (bulk streams; zero otherwise)
    pub stream: u16,
    /// Globally-unique transfer id
    pub id: u64,
    /// Short transfers are an error for this request
    pub short_not_ok: bool,
    /// Interrupt-on-completion requested
    pub int_req: bool,
    /// Number of payload bytes that follow (OUT/SETUP only)
    pub length: u32,
}

impl RequestHeader {
    /// Size of the body in bytes
    pub const SIZE: usize = 19;

    /// Read a request body from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let addr = reader.read_u8()?;
        let token = Token::from_u8(reader.read_u8()?)?;
        let ep = reader.read_u8()?;
        let stream = reader.read_u16::<BigEndian>()?;
        let id = reader.read_u64::<BigEndian>()?;
        let short_not_ok = reader.read_u8()? != 0;
        let int_req = reader.read_u8()? != 0;
        let length = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            addr,
            token,
            ep,
            stream,
            id,
            short_not_ok,
            int_req,
            length,
        })
    }

    /// Write the request body to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.addr)?;
        writer.write_u8(self.token as u8)?;
        writer.write_u8(self.ep)?;
        writer.write_u16::<BigEndian>(self.stream)?;
        writer.write_u64::<BigEndian>(self.id)?;
        writer.write_u8(self.short_not_ok as u8)?;
        writer.write_u8(self.int_req as u8)?;
        writer.write_u32::<BigEndian>(self.length)?;
        Ok(())
    }
}

/// `RESPONSE` body (19 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// USB token of the completed transfer
    pub token: Token,
    /// Endpoint number
    pub ep: u8,
    /// Transfer id being completed
    pub id: u64,
    /// Completion status
    pub status: TransferStatus,
    /// Number of payload bytes that follow (IN with non-pending status),
    /// or the number of bytes the peer consumed (OUT)
    pub length: u32,
    /// Device address reported by the peer
    pub addr: u8,
}

impl ResponseHeader {
    /// Size of the body in bytes
    pub const SIZE: usize = 19;

    /// Read a response body from a reader
    ///
    /// Rejects announced payload lengths above [`MAX_PAYLOAD`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let token = Token::from_u8(reader.read_u8()?)?;
        let ep = reader.read_u8()?;
        let id = reader.read_u64::<BigEndian>()?;
        let status = TransferStatus::from_i32(reader.read_i32::<BigEndian>()?)?;
        let length = reader.read_u32::<BigEndian>()?;
        let addr = reader.read_u8()?;

        if length > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                length,
                max: MAX_PAYLOAD,
            });
        }

        Ok(Self {
            token,
            ep,
            id,
            status,
            length,
            addr,
        })
    }

    /// Write the response body to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.token as u8)?;
        writer.write_u8(self.ep)?;
        writer.write_u64::<BigEndian>(self.id)?;
        writer.write_i32::<BigEndian>(self.status as i32)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u8(self.addr)?;
        Ok(())
    }

    /// True when payload bytes follow this body on the wire
    pub fn has_payload(&self) -> bool {
        self.length > 0 && !self.status.is_pending()
    }
}

/// `CANCEL` body (11 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelHeader {
    /// Device address believed current on the remote side
    pub addr: u8,
    /// USB token of the transfer to cancel
    pub token: Token,
    /// Endpoint number
    pub ep: u8,
    /// Transfer id to cancel
    pub id: u64,
}

impl CancelHeader {
    /// Size of the body in bytes
    pub const SIZE: usize = 11;

    /// Read a cancel body from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let addr = reader.read_u8()?;
        let token = Token::from_u8(reader.read_u8()?)?;
        let ep = reader.read_u8()?;
        let id = reader.read_u64::<BigEndian>()?;

        Ok(Self { addr, token, ep, id })
    }

    /// Write the cancel body to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.addr)?;
        writer.write_u8(self.token as u8)?;
        writer.write_u8(self.ep)?;
        writer.write_u64::<BigEndian>(self.id)?;
        Ok(())
    }
}

/// Encode a complete `REQUEST` message (tag + body + payload) into one buffer
///
/// The payload must already be sized to `header.length`; the whole unit is
/// written with a single transport write so concurrent senders never
/// interleave.
pub fn encode_request(header: &RequestHeader, payload: &[u8]) -> Result<Vec<u8>> {
    debug_assert_eq!(payload.len(), header.length as usize);

    let mut buf = Vec::with_capacity(1 + RequestHeader::SIZE + payload.len());
    MessageType::Request.write_to(&mut buf)?;
    header.write_to(&mut buf)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a complete `CANCEL` message into one buffer
pub fn encode_cancel(header: &CancelHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1 + CancelHeader::SIZE);
    MessageType::Cancel.write_to(&mut buf)?;
    header.write_to(&mut buf)?;
    Ok(buf)
}

/// Encode a `RESET` message (tag only) into one buffer
pub fn encode_reset() -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1);
    MessageType::Reset.write_to(&mut buf)?;
    Ok(buf)
}
