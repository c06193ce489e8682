//! Session configuration.
//!
//! All tunables for a session are gathered in [`SessionConfig`]. The struct
//! is serde-friendly so deployments can load it from a config file, and it
//! is validated once at construction time: drivers refuse to build sessions
//! from an invalid config instead of failing later on a live connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FramelinkError, Result};

/// Default initial reserve for the pending/writing send buffers (1 MiB).
pub const DEFAULT_SEND_BUF_CAPACITY: usize = 1024 * 1024;

/// Default send-buffer threshold (1 MiB).
pub const DEFAULT_SEND_BUF_THRESHOLD: usize = 1024 * 1024;

/// Default receive buffer capacity (1 MiB).
pub const DEFAULT_RECEIVE_BUF_SIZE: usize = 1024 * 1024;

/// Default stack-vs-heap body copy threshold (256 B).
pub const DEFAULT_SMALL_BODY_SIZE: usize = 256;

/// Hard ceiling for `small_body_size`; the session's stack scratch is this big.
pub const MAX_SMALL_BODY_SIZE: usize = 256;

/// Default maximum frame length (10 MiB).
pub const DEFAULT_MAX_COMMAND_LENGTH: u32 = 10 * 1024 * 1024;

/// Default clean-shutdown deadline.
pub const DEFAULT_UNBIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default backpressure low watermark (512 KiB).
pub const DEFAULT_BACKPRESSURE_LOW: usize = 512 * 1024;

/// Default backpressure high watermark (1 MiB).
pub const DEFAULT_BACKPRESSURE_HIGH: usize = 1024 * 1024;

/// Default producer-shard count for the lock-free expirator ring.
pub const DEFAULT_NUM_SHARDS: usize = 4;

/// Configuration snapshot taken by every session at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Initial reserve for the pending/writing send buffers.
    pub send_buf_capacity: usize,
    /// Level above which `send_buf_available` fires once the buffer drains.
    pub send_buf_threshold: usize,
    /// Capacity of the compacting receive buffer.
    pub receive_buf_size: usize,
    /// Bodies at or below this size are copied through a stack scratch.
    pub small_body_size: usize,
    /// Frames longer than this are a fatal framing error.
    pub max_command_length: u32,
    /// How long to wait for `unbind_resp` before force-closing.
    pub unbind_timeout: Duration,
    /// Receive resumes once pending bytes drop below this.
    pub backpressure_low_watermark: usize,
    /// Receive pauses once pending bytes exceed this.
    pub backpressure_high_watermark: usize,
    /// Producer-shard count for the lock-free expirator (ring = shards * 1024).
    pub num_shards: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buf_capacity: DEFAULT_SEND_BUF_CAPACITY,
            send_buf_threshold: DEFAULT_SEND_BUF_THRESHOLD,
            receive_buf_size: DEFAULT_RECEIVE_BUF_SIZE,
            small_body_size: DEFAULT_SMALL_BODY_SIZE,
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            unbind_timeout: DEFAULT_UNBIND_TIMEOUT,
            backpressure_low_watermark: DEFAULT_BACKPRESSURE_LOW,
            backpressure_high_watermark: DEFAULT_BACKPRESSURE_HIGH,
            num_shards: DEFAULT_NUM_SHARDS,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration.
    ///
    /// Rejects zero sizes where forbidden, watermarks out of order or above
    /// the send capacity, a threshold above the send capacity, and a
    /// `small_body_size` the stack scratch cannot hold.
    pub fn validate(&self) -> Result<()> {
        if self.send_buf_capacity == 0 {
            return Err(FramelinkError::InvalidConfig(
                "send_buf_capacity must be non-zero".into(),
            ));
        }
        if self.receive_buf_size == 0 {
            return Err(FramelinkError::InvalidConfig(
                "receive_buf_size must be non-zero".into(),
            ));
        }
        if self.max_command_length == 0 {
            return Err(FramelinkError::InvalidConfig(
                "max_command_length must be non-zero".into(),
            ));
        }
        if self.small_body_size == 0 || self.small_body_size > MAX_SMALL_BODY_SIZE {
            return Err(FramelinkError::InvalidConfig(format!(
                "small_body_size must be in 1..={}",
                MAX_SMALL_BODY_SIZE
            )));
        }
        if self.send_buf_threshold > self.send_buf_capacity {
            return Err(FramelinkError::InvalidConfig(
                "send_buf_threshold exceeds send_buf_capacity".into(),
            ));
        }
        if self.backpressure_low_watermark > self.backpressure_high_watermark {
            return Err(FramelinkError::InvalidConfig(
                "backpressure_low_watermark exceeds backpressure_high_watermark".into(),
            ));
        }
        if self.backpressure_high_watermark > self.send_buf_capacity {
            return Err(FramelinkError::InvalidConfig(
                "backpressure_high_watermark exceeds send_buf_capacity".into(),
            ));
        }
        if self.num_shards == 0 {
            return Err(FramelinkError::InvalidConfig(
                "num_shards must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
