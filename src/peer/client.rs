//! Connect-side peer facade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{make_expirator, ExpiratorKind, PacketHandler, SessionEvent, SessionEventHandler};
use crate::client::{Client, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_RECONNECT_DELAY};
use crate::config::SessionConfig;
use crate::error::{FramelinkError, Result};
use crate::expirator::Expirator;
use crate::protocol::{BindResponse, Request, Response, StreamRequest, StreamResponse};
use crate::session::Session;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct PeerClientShared {
    client_id: String,
    server_id: Mutex<String>,
    request_timeout: Duration,
    auto_reconnect: bool,
    session: Mutex<Option<Session>>,
    client_slot: Mutex<Option<Client>>,
    request_handler: Mutex<PacketHandler>,
    response_handler: Mutex<PacketHandler>,
    timeout_handler: Mutex<PacketHandler>,
    bound_handler: Mutex<Option<Box<dyn FnMut(&str) + Send>>>,
    closed_handler: Mutex<Option<Box<dyn FnMut(&str) + Send>>>,
    session_event_handler: Mutex<Option<SessionEventHandler>>,
}

impl PeerClientShared {
    fn server_id(&self) -> String {
        self.server_id.lock().clone()
    }

    fn emit_event(&self, event: SessionEvent) {
        let server_id = self.server_id();
        if let Some(handler) = self.session_event_handler.lock().as_mut() {
            handler(&server_id, event);
        }
    }
}

/// One bound client connection with request-timeout tracking.
///
/// `send_request` stamps every outgoing request into the outstanding
/// table; the matching response or the timeout handler fires for each,
/// never both. A close surfaces every outstanding request as a timeout.
pub struct PeerClient {
    shared: Arc<PeerClientShared>,
    expirator: Arc<dyn Expirator<u32, String>>,
    client: Client,
}

impl PeerClient {
    /// Start building a peer client.
    pub fn builder() -> PeerClientBuilder {
        PeerClientBuilder::default()
    }

    /// Begin connecting (and reconnecting, when enabled).
    pub fn start(&self) {
        self.client.start();
    }

    /// Stop reconnecting and unbind the bound session, if any.
    pub fn stop(&self) {
        self.client.stop();
        if let Some(session) = self.shared.session.lock().take() {
            session.unbind();
        }
    }

    /// Send a tracked request. The response handler or the timeout handler
    /// will fire for the returned sequence number.
    pub fn send_request(&self, message: &str) -> Result<u32> {
        let session = self
            .shared
            .session
            .lock()
            .clone()
            .ok_or(FramelinkError::SessionClosed)?;
        let sequence = session.send_request(Request::Stream(StreamRequest {
            message_body: message.to_string(),
        }))?;

        if !self
            .expirator
            .add(sequence, self.shared.request_timeout, message.to_string())
        {
            // Only the lock-free table can reject (ring full); the request
            // is already on the wire, it just won't time out.
            tracing::warn!(sequence, "outstanding-request table rejected entry");
        }
        Ok(sequence)
    }

    /// Send an untracked request: no timeout will ever fire for it.
    pub fn send_info(&self, message: &str) -> Result<u32> {
        let session = self
            .shared
            .session
            .lock()
            .clone()
            .ok_or(FramelinkError::SessionClosed)?;
        session.send_request(Request::Stream(StreamRequest {
            message_body: message.to_string(),
        }))
    }

    /// Answer a request received from the peer.
    pub fn send_response(&self, message: &str, sequence: u32) -> Result<()> {
        let session = self
            .shared
            .session
            .lock()
            .clone()
            .ok_or(FramelinkError::SessionClosed)?;
        session.send_response(
            Response::Stream(StreamResponse {
                message_body: message.to_string(),
            }),
            sequence,
            crate::protocol::CommandStatus::Ok,
        )
    }

    /// Whether a bound, open session exists right now.
    pub fn is_connected(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.is_open())
            .unwrap_or(false)
    }

    /// Identity this client binds as.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Identity of the bound server (empty before the first bind).
    pub fn server_id(&self) -> String {
        self.shared.server_id()
    }

    /// Requests currently awaiting a response.
    pub fn outstanding_requests(&self) -> usize {
        self.expirator.len()
    }
}

fn on_bound(
    shared: &Arc<PeerClientShared>,
    expirator: &Arc<dyn Expirator<u32, String>>,
    bind_resp: BindResponse,
    session: Session,
) {
    *shared.server_id.lock() = bind_resp.system_id;
    tracing::debug!(
        client_id = %shared.client_id,
        server_id = %shared.server_id(),
        "bound"
    );

    let request_shared = shared.clone();
    session.set_request_handler(move |request, sequence| {
        if let Request::Stream(stream_req) = request {
            let server_id = request_shared.server_id();
            (*request_shared.request_handler.lock())(
                &server_id,
                sequence,
                stream_req.message_body,
            );
        }
    });

    let response_shared = shared.clone();
    let response_expirator = expirator.clone();
    session.set_response_handler(move |response, sequence, _status| {
        if let Response::Stream(stream_resp) = response {
            response_expirator.remove(&sequence);
            let server_id = response_shared.server_id();
            (*response_shared.response_handler.lock())(
                &server_id,
                sequence,
                stream_resp.message_body,
            );
        }
    });

    let close_shared = shared.clone();
    let close_expirator = expirator.clone();
    session.add_close_handler(move |reason| {
        match &reason {
            Some(reason) => tracing::warn!(%reason, "session closed on error"),
            None => tracing::debug!("session closed gracefully"),
        }
        *close_shared.session.lock() = None;
        close_expirator.expire_all();

        let server_id = close_shared.server_id();
        if let Some(handler) = close_shared.closed_handler.lock().as_mut() {
            handler(&server_id);
        }
        close_shared.emit_event(SessionEvent::Closed);

        if close_shared.auto_reconnect {
            if let Some(client) = close_shared.client_slot.lock().clone() {
                client.start();
            }
        }
    });

    *shared.session.lock() = Some(session);

    shared.emit_event(SessionEvent::Bound);
    let server_id = shared.server_id();
    if let Some(handler) = shared.bound_handler.lock().as_mut() {
        handler(&server_id);
    }
}

/// Fluent builder for [`PeerClient`].
pub struct PeerClientBuilder {
    addr: Option<SocketAddr>,
    client_id: String,
    request_timeout: Duration,
    inactivity_timeout: Duration,
    reconnect_delay: Duration,
    auto_reconnect: bool,
    session_config: SessionConfig,
    expirator_kind: ExpiratorKind,
    request_handler: Option<PacketHandler>,
    response_handler: Option<PacketHandler>,
    timeout_handler: Option<PacketHandler>,
    bound_handler: Option<Box<dyn FnMut(&str) + Send>>,
    closed_handler: Option<Box<dyn FnMut(&str) + Send>>,
    session_event_handler: Option<SessionEventHandler>,
}

impl Default for PeerClientBuilder {
    fn default() -> Self {
        Self {
            addr: None,
            client_id: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            auto_reconnect: true,
            session_config: SessionConfig::default(),
            expirator_kind: ExpiratorKind::default(),
            request_handler: None,
            response_handler: None,
            timeout_handler: None,
            bound_handler: None,
            closed_handler: None,
            session_event_handler: None,
        }
    }
}

impl PeerClientBuilder {
    /// Server endpoint. Required.
    pub fn with_address(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Identity to bind as.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Per-request timeout for the outstanding table.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Keep-alive idle time for the transport layer.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Pause between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Reconnect automatically after failures and closes.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Session configuration for the connection.
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

    /// Notification after each successful bind.
    pub fn with_bound_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.bound_handler = Some(Box::new(handler));
        self
    }

    /// Notification after each session close.
    pub fn with_closed_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.closed_handler = Some(Box::new(handler));
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

    /// Validate and build. Does not connect; call [`PeerClient::start`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime: the expirator's driver
    /// task is spawned here.
    pub fn build(self) -> Result<PeerClient> {
        let addr = self.addr.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerClient requires an address".into())
        })?;
        let request_handler = self.request_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerClient requires a request handler".into())
        })?;
        let response_handler = self.response_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerClient requires a response handler".into())
        })?;
        let timeout_handler = self.timeout_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("PeerClient requires a timeout handler".into())
        })?;

        let shared = Arc::new(PeerClientShared {
            client_id: self.client_id.clone(),
            server_id: Mutex::new(String::new()),
            request_timeout: self.request_timeout,
            auto_reconnect: self.auto_reconnect,
            session: Mutex::new(None),
            client_slot: Mutex::new(None),
            request_handler: Mutex::new(request_handler),
            response_handler: Mutex::new(response_handler),
            timeout_handler: Mutex::new(timeout_handler),
            bound_handler: Mutex::new(self.bound_handler),
            closed_handler: Mutex::new(self.closed_handler),
            session_event_handler: Mutex::new(self.session_event_handler),
        });

        let timeout_shared = shared.clone();
        let expirator = make_expirator(self.expirator_kind, move |sequence, message| {
            let server_id = timeout_shared.server_id();
            (*timeout_shared.timeout_handler.lock())(&server_id, sequence, message);
        });
        expirator.start();

        let bind_shared = shared.clone();
        let bind_expirator = expirator.clone();
        let client = Client::builder()
            .with_address(addr)
            .with_system_id(self.client_id)
            .with_inactivity_timeout(self.inactivity_timeout)
            .with_reconnect_delay(self.reconnect_delay)
            .with_auto_reconnect(self.auto_reconnect)
            .with_session_config(self.session_config)
            .with_bind_handler(move |bind_resp, session| {
                on_bound(&bind_shared, &bind_expirator, bind_resp, session);
            })
            .with_error_handler(|message| {
                tracing::warn!(%message, "bind attempt failed");
            })
            .build()?;

        *shared.client_slot.lock() = Some(client.clone());

        Ok(PeerClient {
            shared,
            expirator,
            client,
        })
    }
}
