//! Accept-side peer facade.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{make_expirator, ExpiratorKind, PacketHandler, SessionEvent, SessionEventHandler};
use crate::client::DEFAULT_INACTIVITY_TIMEOUT;
use crate::config::SessionConfig;
use crate::error::{FramelinkError, Result};
use crate::expirator::Expirator;
use crate::peer::client::DEFAULT_REQUEST_TIMEOUT;
use crate::protocol::{CommandStatus, Request, Response, StreamRequest, StreamResponse};
use crate::server::{Server, ServerBuilder};
use crate::session::{AggregateMetrics, Session};

struct PeerEntry {
    session: Session,
    expirator: Arc<dyn Expirator<u32, String>>,
}

struct PeerServerShared {
    request_timeout: Duration,
    expirator_kind: ExpiratorKind,
    peers: Mutex<BTreeMap<String, PeerEntry>>,
    cursor: Mutex<usize>,
    request_handler: Mutex<PacketHandler>,
    response_handler: Mutex<PacketHandler>,
    timeout_handler: Mutex<PacketHandler>,
    session_event_handler: Mutex<Option<SessionEventHandler>>,
}

impl PeerServerShared {
    fn emit_event(&self, peer_id: &str, event: SessionEvent) {
        if let Some(handler) = self.session_event_handler.lock().as_mut() {
            handler(peer_id, event);
        }
    }

    fn entry(&self, peer_id: &str) -> Result<(Session, Arc<dyn Expirator<u32, String>>)> {
        self.peers
            .lock()
            .get(peer_id)
            .map(|entry| (entry.session.clone(), entry.expirator.clone()))
            .ok_or_else(|| {
                FramelinkError::Protocol(format!("No bound peer with id {peer_id:?}"))
            })
    }
}

/// Server facade keying bound sessions by the peers' `system_id`, each
/// with its own outstanding-request expirator.
pub struct PeerServer {
    shared: Arc<PeerServerShared>,
    server: Server,
}

impl PeerServer {
    /// Start building a peer server.
    pub fn builder() -> PeerServerBuilder {
        PeerServerBuilder::default()
    }

    /// Address the listener bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Identities of every bound peer.
    pub fn client_ids(&self) -> Vec<String> {
        self.shared.peers.lock().keys().cloned().collect()
    }

    /// Number of bound peers.
    pub fn session_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Aggregate session metrics.
    pub fn metrics(&self) -> AggregateMetrics {
        self.server.metrics()
    }

    /// Send a tracked request to a specific peer.
    pub fn send_request(&self, message: &str, peer_id: &str) -> Result<u32> {
        let (session, expirator) = self.shared.entry(peer_id)?;
        let sequence = session.send_request(Request::Stream(StreamRequest {
            message_body: message.to_string(),
        }))?;
        if !expirator.add(sequence, self.shared.request_timeout, message.to_string()) {
            tracing::warn!(sequence, peer_id, "outstanding-request table rejected entry");
        }
        Ok(sequence)
    }

    /// Send a tracked request to the next peer in round-robin order.
    pub fn send_request_round_robin(&self, message: &str) -> Result<(u32, String)> {
        let peer_id = {
            let peers = self.shared.peers.lock();
            if peers.is_empty() {
                return Err(FramelinkError::Protocol("No bound peers".into()));
            }
            let mut cursor = self.shared.cursor.lock();
            let index = *cursor % peers.len();
            *cursor = (*cursor + 1) % peers.len();
            peers.keys().nth(index).cloned().unwrap_or_default()
        };
        let sequence = self.send_request(message, &peer_id)?;
        Ok((sequence, peer_id))
    }

    /// Send an untracked request to every bound peer. Broadcasts expect no
    /// reply, so nothing lands in the outstanding tables and no timeout
    /// ever fires for them. Returns one `(peer id, sequence)` pair per
    /// successful send.
    pub fn broadcast(&self, message: &str) -> Vec<(String, u32)> {
        let targets: Vec<(String, Session)> = self
            .shared
            .peers
            .lock()
            .iter()
            .map(|(peer_id, entry)| (peer_id.clone(), entry.session.clone()))
            .collect();

        let mut sent = Vec::with_capacity(targets.len());
        for (peer_id, session) in targets {
            match session.send_request(Request::Stream(StreamRequest {
                message_body: message.to_string(),
            })) {
                Ok(sequence) => sent.push((peer_id, sequence)),
                Err(err) => {
                    tracing::warn!(%peer_id, %err, "broadcast send failed");
                }
            }
        }
        sent
    }

    /// Answer a request previously received from `peer_id`.
    pub fn send_response(&self, message: &str, sequence: u32, peer_id: &str) -> Result<()> {
        let (session, _) = self.shared.entry(peer_id)?;
        session.send_response(
            Response::Stream(StreamResponse {
                message_body: message.to_string(),
            }),
            sequence,
            CommandStatus::Ok,
        )
    }

    /// Stop accepting and unbind every bound peer.
    pub fn stop(&self) {
        self.server.stop();
        let sessions: Vec<Session> = self
            .shared
            .peers
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        for session in sessions {
            session.unbind();
        }
    }
}

/// Fluent builder for [`PeerServer`].
pub struct PeerServerBuilder {
    system_id: String,
    request_timeout: Duration,
    inactivity_timeout: Duration,
    session_config: SessionConfig,
    expirator_kind: ExpiratorKind,
    request_handler: Option<PacketHandler>,
    response_handler: Option<PacketHandler>,
    timeout_handler: Option<PacketHandler>,
    session_event_handler: Option<SessionEventHandler>,
}

impl Default for PeerServerBuilder {
    fn default() -> Self {
        Self {
            system_id: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            session_config: SessionConfig::default(),
            expirator_kind: ExpiratorKind::default(),
            request_handler: None,
            response_handler: None,
            timeout_handler: None,
            session_event_handler: None,
        }
    }
}

impl PeerServerBuilder {
    /// Identity echoed to binding peers.
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = system_id.into();
        self
    }

    /// Per-request timeout for every peer's outstanding table.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Keep-alive idle time for accepted sockets.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Session configuration for accepted connections.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Which expirator implementation tracks outstanding requests.
    pub fn with_expirator_kind(mut self, kind: ExpiratorKind) -> Self {
        self.expirator_kind = kind;
        self
    }

    /// Handler for incoming requests. Required.
    pub fn with_request_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, u32, String) + Send + 'static,
    {
        self.request_handler = Some(Box::new(handler));
        self
    }

    /// Handler for responses to tracked requests. Required.
    pub fn with_response_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, u32, String) + Send + 'static,
    {
        self.response_handler = Some(Box::new(handler));
        self
    }

    /// Handler for requests that timed out. Required.
    pub fn with_timeout_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, u32, String) + Send + 'static,
    {
        self.timeout_handler = Some(Box::new(handler));
        self
    }

    /// Lifecycle event stream.
    pub fn with_session_event_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, SessionEvent) + Send + 'static,
    {
        self.session_event_handler = Some(Box::new(handler));
        self
    }

    /// Bind the listener and start accepting peers.
    pub async fn bind(self, addr: SocketAddr) -> Result<PeerServer> {
        let request_handler = self.request_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerServer requires a request handler".into())
        })?;
        let response_handler = self.response_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerServer requires a response handler".into())
        })?;
        let timeout_handler = self.timeout_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerServer requires a timeout handler".into())
        })?;

        let shared = Arc::new(PeerServerShared {
            request_timeout: self.request_timeout,
            expirator_kind: self.expirator_kind,
            peers: Mutex::new(BTreeMap::new()),
            cursor: Mutex::new(0),
            request_handler: Mutex::new(request_handler),
            response_handler: Mutex::new(response_handler),
            timeout_handler: Mutex::new(timeout_handler),
            session_event_handler: Mutex::new(self.session_event_handler),
        });

        let bind_shared = shared.clone();
        let server = ServerBuilder::default()
            .with_system_id(self.system_id)
            .with_inactivity_timeout(self.inactivity_timeout)
            .with_session_config(self.session_config)
            .with_bind_handler(move |bind_req, session| {
                on_peer_bind(&bind_shared, &bind_req.system_id, session)
            })
            .bind(addr)
            .await?;

        Ok(PeerServer { shared, server })
    }
}

fn on_peer_bind(shared: &Arc<PeerServerShared>, peer_id: &str, session: &Session) -> bool {
    if peer_id.is_empty() {
        tracing::warn!("rejecting bind with empty system_id");
        return false;
    }
    if shared.peers.lock().contains_key(peer_id) {
        tracing::warn!(peer_id, "rejecting duplicate bind");
        return false;
    }

    let peer_id = peer_id.to_string();

    let timeout_shared = shared.clone();
    let timeout_peer = peer_id.clone();
    let expirator = make_expirator(shared.expirator_kind, move |sequence, message| {
        (*timeout_shared.timeout_handler.lock())(&timeout_peer, sequence, message);
    });
    expirator.start();

    let request_shared = shared.clone();
    let request_peer = peer_id.clone();
    session.set_request_handler(move |request, sequence| {
        if let Request::Stream(stream_req) = request {
            (*request_shared.request_handler.lock())(
                &request_peer,
                sequence,
                stream_req.message_body,
            );
        }
    });

    let response_shared = shared.clone();
    let response_peer = peer_id.clone();
    let response_expirator = expirator.clone();
    session.set_response_handler(move |response, sequence, _status| {
        if let Response::Stream(stream_resp) = response {
            response_expirator.remove(&sequence);
            (*response_shared.response_handler.lock())(
                &response_peer,
                sequence,
                stream_resp.message_body,
            );
        }
    });

    let close_shared = shared.clone();
    let close_peer = peer_id.clone();
    session.add_close_handler(move |_reason| {
        if let Some(entry) = close_shared.peers.lock().remove(&close_peer) {
            entry.expirator.expire_all();
        }
        close_shared.emit_event(&close_peer, SessionEvent::Closed);
    });

    shared.peers.lock().insert(
        peer_id.clone(),
        PeerEntry {
            session: session.clone(),
            expirator,
        },
    );
    shared.emit_event(&peer_id, SessionEvent::Bound);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_requires_handlers() {
        let result = PeerServer::builder()
            .with_system_id("srv")
            .bind("127.0.0.1:0".parse().unwrap())
            .await;
        assert!(matches!(result, Err(FramelinkError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_addressing_unknown_peer_fails() {
        let server = PeerServer::builder()
            .with_system_id("srv")
            .with_request_handler(|_, _, _| {})
            .with_response_handler(|_, _, _| {})
            .with_timeout_handler(|_, _, _| {})
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(server.session_count(), 0);
        assert!(server.client_ids().is_empty());
        assert!(server.send_request("hi", "nobody").is_err());
        assert!(server.send_request_round_robin("hi").is_err());
    }
}
