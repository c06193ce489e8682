//! Protocol data units and their body codecs.
//!
//! Requests and responses are tagged enums over the four command families;
//! dispatch is a `match`, not a virtual call. Body layouts per command:
//!
//! - `bind_req` / `bind_resp`: one C-style octet string `system_id` — bytes
//!   up to a NUL terminator (NUL excluded from the value), at most 20 bytes
//!   including the terminator.
//! - `stream_req` / `stream_resp`: a raw octet string consuming the entire
//!   remaining body.
//! - `unbind_*`, `enquire_link_*`: empty body.
//!
//! Responses with an empty body decode to their default value; a request
//! body that is shorter than its declared fields is malformed.

use crate::error::{FramelinkError, Result};
use crate::protocol::wire_format::{CommandId, CommandStatus, FrameHeader, HEADER_SIZE};

/// Maximum encoded size of `system_id`, including the NUL terminator.
pub const SYSTEM_ID_MAX: usize = 20;

/// Session handshake request carrying the peer's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindRequest {
    /// Identity the peer binds as.
    pub system_id: String,
}

/// Session handshake response carrying the acceptor's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindResponse {
    /// Identity of the accepting side.
    pub system_id: String,
}

/// Payload-carrying request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    /// Message body, the entire remaining frame.
    pub message_body: String,
}

/// Payload-carrying response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResponse {
    /// Message body, the entire remaining frame.
    pub message_body: String,
}

/// Requests surfaced to user handlers.
///
/// `unbind_req` and `enquire_link_req` are absorbed by the session itself
/// and never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Handshake request.
    Bind(BindRequest),
    /// Payload request.
    Stream(StreamRequest),
}

/// Responses surfaced to user handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Handshake response.
    Bind(BindResponse),
    /// Payload response.
    Stream(StreamResponse),
}

impl Request {
    /// Command id this request travels under.
    pub fn command(&self) -> CommandId {
        match self {
            Self::Bind(_) => CommandId::BindReq,
            Self::Stream(_) => CommandId::StreamReq,
        }
    }

    /// Append the body encoding to `out`.
    pub fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Bind(pdu) => encode_c_octet_str(out, &pdu.system_id, SYSTEM_ID_MAX)
                .map_err(|message| codec_error(message, CommandId::BindReq)),
            Self::Stream(pdu) => {
                out.extend_from_slice(pdu.message_body.as_bytes());
                Ok(())
            }
        }
    }

    /// Decode a request body for the given command id.
    ///
    /// Only the user-visible commands are accepted here; the session handles
    /// `unbind_req` and `enquire_link_req` before decoding.
    pub fn decode(command: CommandId, body: &[u8]) -> Result<Self> {
        match command {
            CommandId::BindReq => {
                let system_id = decode_c_octet_str(body, SYSTEM_ID_MAX)
                    .map_err(|message| codec_error(message, command))?;
                Ok(Self::Bind(BindRequest { system_id }))
            }
            CommandId::StreamReq => {
                let message_body =
                    decode_octet_str(body).map_err(|message| codec_error(message, command))?;
                Ok(Self::Stream(StreamRequest { message_body }))
            }
            other => Err(FramelinkError::Protocol(format!(
                "Command {other:?} carries no request body"
            ))),
        }
    }
}

impl Response {
    /// Command id this response travels under.
    pub fn command(&self) -> CommandId {
        match self {
            Self::Bind(_) => CommandId::BindResp,
            Self::Stream(_) => CommandId::StreamResp,
        }
    }

    /// Append the body encoding to `out`.
    pub fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Bind(pdu) => encode_c_octet_str(out, &pdu.system_id, SYSTEM_ID_MAX)
                .map_err(|message| codec_error(message, CommandId::BindResp)),
            Self::Stream(pdu) => {
                out.extend_from_slice(pdu.message_body.as_bytes());
                Ok(())
            }
        }
    }

    /// Decode a response body for the given command id.
    ///
    /// An empty body is a valid response and decodes to the default value.
    pub fn decode(command: CommandId, body: &[u8]) -> Result<Self> {
        match command {
            CommandId::BindResp => {
                if body.is_empty() {
                    return Ok(Self::Bind(BindResponse::default()));
                }
                let system_id = decode_c_octet_str(body, SYSTEM_ID_MAX)
                    .map_err(|message| codec_error(message, command))?;
                Ok(Self::Bind(BindResponse { system_id }))
            }
            CommandId::StreamResp => {
                let message_body =
                    decode_octet_str(body).map_err(|message| codec_error(message, command))?;
                Ok(Self::Stream(StreamResponse { message_body }))
            }
            other => Err(FramelinkError::Protocol(format!(
                "Command {other:?} carries no response body"
            ))),
        }
    }
}

/// Serialize a full frame onto `out`: reserve the header, encode the body,
/// then patch the header with the final length. On a body encoding error
/// the reserved bytes are rolled back and `out` is left untouched.
pub fn append_frame<F>(
    out: &mut Vec<u8>,
    command: CommandId,
    status: CommandStatus,
    sequence: u32,
    body: F,
) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let start = out.len();
    out.resize(start + HEADER_SIZE, 0);

    if let Err(err) = body(out) {
        out.truncate(start);
        return Err(err);
    }

    let length = (out.len() - start) as u32;
    FrameHeader::new(length, command, status, sequence)
        .encode_into(&mut out[start..start + HEADER_SIZE]);
    Ok(())
}

/// Serialize a body-less frame (unbind, enquire_link) onto `out`.
pub fn append_command(out: &mut Vec<u8>, command: CommandId, status: CommandStatus, sequence: u32) {
    let header = FrameHeader::new(HEADER_SIZE as u32, command, status, sequence);
    out.extend_from_slice(&header.encode());
}

fn codec_error(message: String, command: CommandId) -> FramelinkError {
    FramelinkError::Codec {
        message,
        command: command as u8,
    }
}

/// Encode a NUL-terminated octet string. `max` bounds the encoded size
/// including the terminator.
fn encode_c_octet_str(
    out: &mut Vec<u8>,
    value: &str,
    max: usize,
) -> std::result::Result<(), String> {
    if value.len() + 1 > max {
        return Err(format!(
            "c_octet_str of {} bytes exceeds limit {max} (terminator included)",
            value.len() + 1
        ));
    }
    if value.as_bytes().contains(&0) {
        return Err("c_octet_str value contains an embedded NUL".into());
    }
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

/// Decode a NUL-terminated octet string; the NUL is excluded from the value.
fn decode_c_octet_str(buf: &[u8], max: usize) -> std::result::Result<String, String> {
    let null_pos = match buf.iter().position(|&b| b == 0) {
        Some(pos) => pos,
        None => return Err("c_octet_str has no NUL terminator".into()),
    };

    if null_pos + 1 > max {
        return Err(format!(
            "c_octet_str of {} bytes exceeds limit {max} (terminator included)",
            null_pos + 1
        ));
    }

    String::from_utf8(buf[..null_pos].to_vec()).map_err(|_| "c_octet_str is not valid UTF-8".into())
}

/// Decode a raw octet string consuming the entire buffer.
fn decode_octet_str(buf: &[u8]) -> std::result::Result<String, String> {
    String::from_utf8(buf.to_vec()).map_err(|_| "octet_str is not valid UTF-8".into())
}
