//! Wire format encoding and decoding.
//!
//! Implements the 10-byte header format:
//! ```text
//! ┌────────────┬─────────┬─────────┬────────────┐
//! │ Length     │ Command │ Status  │ Sequence   │
//! │ 4 bytes    │ 1 byte  │ 1 byte  │ 4 bytes    │
//! │ uint32 BE  │         │         │ uint32 BE  │
//! └────────────┴─────────┴─────────┴────────────┘
//! ```
//!
//! `Length` covers the whole frame (header + body) and is therefore never
//! below 10. Bit 7 of the command id distinguishes responses (set) from
//! requests (clear). All multi-byte integers are Big Endian.

use crate::error::{FramelinkError, Result};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Command-id bit that marks a response.
const RESPONSE_BIT: u8 = 0x80;

/// Protocol data unit identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Session handshake request.
    BindReq = 0x01,
    /// Session handshake response.
    BindResp = 0x81,
    /// Payload-carrying request.
    StreamReq = 0x02,
    /// Payload-carrying response.
    StreamResp = 0x82,
    /// Graceful teardown request.
    UnbindReq = 0x03,
    /// Graceful teardown response.
    UnbindResp = 0x83,
    /// Heartbeat request.
    EnquireLinkReq = 0x04,
    /// Heartbeat response.
    EnquireLinkResp = 0x84,
}

impl CommandId {
    /// Decode a command id byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::BindReq),
            0x81 => Ok(Self::BindResp),
            0x02 => Ok(Self::StreamReq),
            0x82 => Ok(Self::StreamResp),
            0x03 => Ok(Self::UnbindReq),
            0x83 => Ok(Self::UnbindResp),
            0x04 => Ok(Self::EnquireLinkReq),
            0x84 => Ok(Self::EnquireLinkResp),
            other => Err(FramelinkError::Protocol(format!(
                "Unknown command id {other:#04x}"
            ))),
        }
    }

    /// Check whether bit 7 marks this command as a response.
    #[inline]
    pub fn is_response(self) -> bool {
        (self as u8) & RESPONSE_BIT != 0
    }

    /// The response counterpart of a request id (identity for responses).
    #[inline]
    pub fn response_of(self) -> CommandId {
        match self {
            Self::BindReq => Self::BindResp,
            Self::StreamReq => Self::StreamResp,
            Self::UnbindReq => Self::UnbindResp,
            Self::EnquireLinkReq => Self::EnquireLinkResp,
            other => other,
        }
    }
}

/// Outcome carried by response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CommandStatus {
    /// No error.
    #[default]
    Ok = 0x00,
    /// Failed.
    Fail = 0xFF,
}

impl CommandStatus {
    /// Decode a status byte. Anything non-zero is a failure.
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Ok
        } else {
            Self::Fail
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length in bytes (header + body), at least 10.
    pub length: u32,
    /// Command identifier.
    pub command: CommandId,
    /// Command status (meaningful on responses only).
    pub status: CommandStatus,
    /// Sequence number (0 is reserved as "unassigned").
    pub sequence: u32,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(length: u32, command: CommandId, status: CommandStatus, sequence: u32) -> Self {
        Self {
            length,
            command,
            status,
            sequence,
        }
    }

    /// Encode the header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `HEADER_SIZE` (10 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4] = self.command as u8;
        buf[5] = self.status as u8;
        buf[6..10].copy_from_slice(&self.sequence.to_be_bytes());
    }

    /// Decode a header from bytes (Big Endian).
    ///
    /// Fails when the buffer is short, the command id is unknown, or the
    /// declared length is below the header size.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(FramelinkError::Protocol(format!(
                "Header needs {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let command = CommandId::from_u8(buf[4])?;
        let status = CommandStatus::from_u8(buf[5]);
        let sequence = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);

        if length < HEADER_SIZE as u32 {
            return Err(FramelinkError::Protocol(format!(
                "Declared frame length {length} below header size"
            )));
        }

        Ok(Self {
            length,
            command,
            status,
            sequence,
        })
    }

    /// Validate the declared length against the configured ceiling.
    pub fn validate_length(&self, max_command_length: u32) -> Result<()> {
        if self.length > max_command_length {
            return Err(FramelinkError::FrameTooLarge {
                length: self.length,
                max: max_command_length,
            });
        }
        Ok(())
    }

    /// Body length in bytes declared by this header.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }
}
