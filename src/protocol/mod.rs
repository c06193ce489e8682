//! Protocol module - wire format, PDUs, and the receive buffer.
//!
//! This module implements the binary session protocol:
//! - 10-byte header encoding/decoding
//! - Tagged request/response PDUs with per-command body codecs
//! - Compacting flat buffer for accumulating partial reads

mod flat_buffer;
mod pdu;
mod wire_format;

pub use flat_buffer::FlatBuffer;
pub use pdu::{
    append_command, append_frame, BindRequest, BindResponse, Request, Response, StreamRequest,
    StreamResponse, SYSTEM_ID_MAX,
};
pub use wire_format::{CommandId, CommandStatus, FrameHeader, HEADER_SIZE};
