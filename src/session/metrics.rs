//! Per-session metrics.
//!
//! Counters are written by the session's owning task with relaxed ordering;
//! readers (the session manager's aggregation among them) may read them
//! concurrently at any time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Monotonic counter block owned by one session.
#[derive(Debug)]
pub struct SessionMetrics {
    /// Payload and header bytes handed to the transport.
    pub bytes_sent: AtomicU64,
    /// Bytes read from the transport.
    pub bytes_received: AtomicU64,
    /// Frames serialized for sending.
    pub messages_sent: AtomicU64,
    /// Complete frames decoded from the receive buffer.
    pub messages_received: AtomicU64,
    /// Errors observed on this session.
    pub errors: AtomicU64,
    /// Receive-buffer compactions.
    pub buffer_compactions: AtomicU64,
    /// Whether the session has closed.
    pub is_closed: AtomicBool,
    created_at: Instant,
}

impl SessionMetrics {
    pub(crate) fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            buffer_compactions: AtomicU64::new(0),
            is_closed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Time since the session was created.
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Take a consistent-enough snapshot for aggregation.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            bytes_received: self.bytes_received.load(Ordering::Acquire),
            messages_sent: self.messages_sent.load(Ordering::Acquire),
            messages_received: self.messages_received.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
            buffer_compactions: self.buffer_compactions.load(Ordering::Acquire),
            is_closed: self.is_closed.load(Ordering::Acquire),
            uptime: self.uptime(),
        }
    }

    #[inline]
    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_compactions(&self, total: u64) {
        self.buffer_compactions.store(total, Ordering::Relaxed);
    }
}

/// Plain-value copy of a metrics block.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub buffer_compactions: u64,
    pub is_closed: bool,
    #[serde(skip)]
    pub uptime: Duration,
}
