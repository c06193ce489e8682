//! String-message convenience layer over sessions.
//!
//! A peer facade couples exactly one session to one outstanding-request
//! expirator whose payload is the request body that was sent. A response
//! removes its entry; an expiry surfaces the stored body through the
//! timeout handler; a session close expires every outstanding request so
//! each one is answered or timed out exactly once.
//!
//! - [`PeerClient`] - connect side: bind, auto-reconnect, tracked requests
//! - [`PeerServer`] - accept side: one expirator per bound peer
//! - [`ClientList`] - N clients with broadcast, round-robin and per-peer
//!   addressing

mod client;
mod list;
mod server;

pub use client::{PeerClient, PeerClientBuilder, DEFAULT_REQUEST_TIMEOUT};
pub use list::{ClientList, ClientListBuilder};
pub use server::{PeerServer, PeerServerBuilder};

use std::sync::Arc;

use crate::expirator::{Expirator, HeapExpirator, LockFreeExpirator, TimingWheelExpirator};

/// Lifecycle notification for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The bind handshake completed.
    Bound,
    /// The peer's session closed.
    Closed,
}

/// Handler for `(peer id, sequence, message body)` triples.
pub type PacketHandler = Box<dyn FnMut(&str, u32, String) + Send>;

/// Handler observing peer lifecycle events.
pub type SessionEventHandler = Box<dyn FnMut(&str, SessionEvent) + Send>;

/// Cloneable packet handler for the client list, shared across members.
pub type SharedPacketHandler = Arc<dyn Fn(&str, u32, String) + Send + Sync>;

/// Which expirator implementation backs the outstanding-request table.
///
/// The facades bind to the [`Expirator`] trait, never to a concrete
/// variant; this enum only picks the construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiratorKind {
    /// Binary min-heap (exact timing, the default).
    #[default]
    Heap,
    /// Hierarchical timing wheel (1 ms firing jitter).
    TimingWheel,
    /// MPSC operation ring drained by a consumer task.
    LockFree,
}

pub(crate) fn make_expirator<F>(kind: ExpiratorKind, handler: F) -> Arc<dyn Expirator<u32, String>>
where
    F: FnMut(u32, String) + Send + 'static,
{
    match kind {
        ExpiratorKind::Heap => Arc::new(HeapExpirator::new(handler)),
        ExpiratorKind::TimingWheel => Arc::new(TimingWheelExpirator::new(handler)),
        ExpiratorKind::LockFree => Arc::new(LockFreeExpirator::new(handler)),
    }
}
