//! Error types for framelink.

use thiserror::Error;

/// Main error type for all framelink operations.
#[derive(Debug, Error)]
pub enum FramelinkError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A PDU body could not be decoded for its command id.
    #[error("Codec error (command {command:#04x}): {message}")]
    Codec {
        /// Human-readable description of the malformed field.
        message: String,
        /// Raw command id byte the body was decoded for.
        command: u8,
    },

    /// A frame header declared a length outside the accepted range.
    #[error("Frame length {length} outside accepted range (min 10, max {max})")]
    FrameTooLarge {
        /// Declared frame length.
        length: u32,
        /// Configured ceiling.
        max: u32,
    },

    /// Protocol violation (message in a state that forbids it, unknown command).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation attempted on a session that is no longer open.
    #[error("Session closed")]
    SessionClosed,

    /// The lock-free expirator's operation ring is full.
    #[error("Operation queue full")]
    QueueFull,

    /// Configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias using FramelinkError.
pub type Result<T> = std::result::Result<T, FramelinkError>;
