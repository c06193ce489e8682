//! Registry of live sessions with bulk shutdown and aggregate metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::Session;

/// Opaque, monotone session identifier.
pub type SessionId = u64;

/// Sum of the metric snapshots of every registered session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateMetrics {
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_errors: u64,
    pub active_sessions: usize,
    pub open_sessions: usize,
    pub closed_sessions: usize,
}

/// Map from session id to session handle.
///
/// All map mutations are serialized behind one mutex; iteration works on a
/// snapshot taken under the lock so user callbacks never run while it is
/// held. The drivers wire each session's close handler to
/// [`SessionManager::remove`], which fires exactly once per session.
#[derive(Clone, Default)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl SessionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session id without registering anything.
    ///
    /// Drivers use this to build the close handler (which must know the id)
    /// before the session itself exists.
    pub fn allocate_id(&self) -> SessionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a session under a previously allocated id.
    pub fn insert(&self, id: SessionId, session: Session) {
        self.inner.sessions.lock().insert(id, session);
    }

    /// Register a session under a fresh id.
    pub fn add_session(&self, session: Session) -> SessionId {
        let id = self.allocate_id();
        self.insert(id, session);
        id
    }

    /// Remove a session from the registry.
    pub fn remove(&self, id: SessionId) -> bool {
        self.inner.sessions.lock().remove(&id).is_some()
    }

    /// Look up a session by id.
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.sessions.lock().get(&id).cloned()
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Ids of every registered session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().keys().copied().collect()
    }

    /// Apply `func` to a snapshot of the registry.
    pub fn for_each<F>(&self, mut func: F)
    where
        F: FnMut(SessionId, &Session),
    {
        for (id, session) in self.snapshot() {
            func(id, &session);
        }
    }

    /// Gracefully unbind every session.
    pub fn close_all(&self) {
        for (_, session) in self.snapshot() {
            session.unbind();
        }
    }

    /// Close every session immediately.
    pub fn close_all_immediate(&self) {
        for (_, session) in self.snapshot() {
            session.close(Some("Manager shutdown".into()));
        }
    }

    /// Sum every registered session's metric snapshot.
    pub fn metrics(&self) -> AggregateMetrics {
        let snapshot = self.snapshot();
        let mut agg = AggregateMetrics {
            active_sessions: snapshot.len(),
            ..Default::default()
        };

        for (_, session) in snapshot {
            let m = session.metrics().snapshot();
            agg.total_bytes_sent += m.bytes_sent;
            agg.total_bytes_received += m.bytes_received;
            agg.total_messages_sent += m.messages_sent;
            agg.total_messages_received += m.messages_received;
            agg.total_errors += m.errors;
            if session.is_open() {
                agg.open_sessions += 1;
            }
            if m.is_closed {
                agg.closed_sessions += 1;
            }
        }

        agg
    }

    /// Drop every session whose metrics report it closed. Returns how many
    /// entries were removed.
    pub fn cleanup_closed(&self) -> usize {
        let mut sessions = self.inner.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.metrics().is_closed.load(Ordering::Acquire));
        before - sessions.len()
    }

    fn snapshot(&self) -> Vec<(SessionId, Session)> {
        self.inner
            .sessions
            .lock()
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandId, CommandStatus, FrameHeader, HEADER_SIZE};
    use crate::session::SessionState;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn spawn_session() -> (Session, DuplexStream) {
        let (local, peer) = duplex(64 * 1024);
        let session = Session::builder().build(local).unwrap();
        session.start();
        (session, peer)
    }

    #[tokio::test]
    async fn test_ids_are_monotone() {
        let manager = SessionManager::new();
        let (a, _pa) = spawn_session();
        let (b, _pb) = spawn_session();

        let first = manager.add_session(a);
        let second = manager.add_session(b);
        assert!(second > first);
        assert_eq!(manager.active_count(), 2);

        let mut ids = manager.session_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_remove_is_single_shot() {
        let manager = SessionManager::new();
        let (session, _peer) = spawn_session();
        let id = manager.add_session(session);

        assert!(manager.remove(id));
        assert!(!manager.remove(id));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_get_returns_live_handle() {
        let manager = SessionManager::new();
        let (session, _peer) = spawn_session();
        let id = manager.add_session(session);

        assert!(manager.get(id).unwrap().is_open());
        assert!(manager.get(id + 100).is_none());
    }

    #[tokio::test]
    async fn test_close_all_unbinds() {
        let manager = SessionManager::new();
        let (session, mut peer) = spawn_session();
        manager.add_session(session.clone());

        manager.close_all();

        let mut header_buf = [0u8; HEADER_SIZE];
        peer.read_exact(&mut header_buf).await.unwrap();
        let header = FrameHeader::decode(&header_buf).unwrap();
        assert_eq!(header.command, CommandId::UnbindReq);
        assert_eq!(header.status, CommandStatus::Ok);
        assert_eq!(session.state(), SessionState::Unbinding);
    }

    #[tokio::test]
    async fn test_close_all_immediate() {
        let manager = SessionManager::new();
        let (session, _peer) = spawn_session();
        manager.add_session(session.clone());

        manager.close_all_immediate();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_aggregate_metrics_and_cleanup() {
        let manager = SessionManager::new();
        let (open_session, _open_peer) = spawn_session();
        let (closing_session, _closing_peer) = spawn_session();
        manager.add_session(open_session);
        manager.add_session(closing_session.clone());

        closing_session.close(None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let agg = manager.metrics();
        assert_eq!(agg.active_sessions, 2);
        assert_eq!(agg.open_sessions, 1);
        assert_eq!(agg.closed_sessions, 1);

        assert_eq!(manager.cleanup_closed(), 1);
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_for_each_sees_snapshot() {
        let manager = SessionManager::new();
        let (a, _pa) = spawn_session();
        let (b, _pb) = spawn_session();
        manager.add_session(a);
        manager.add_session(b);

        let mut seen = 0;
        manager.for_each(|_, session| {
            assert!(session.is_open());
            seen += 1;
        });
        assert_eq!(seen, 2);
    }
}
