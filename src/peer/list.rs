//! Aggregation of N peer clients for fan-out messaging.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::client::{PeerClient, DEFAULT_REQUEST_TIMEOUT};
use super::{ExpiratorKind, SessionEvent, SharedPacketHandler};
use crate::client::{DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_RECONNECT_DELAY};
use crate::config::SessionConfig;
use crate::error::{FramelinkError, Result};

/// N peer clients with broadcast, round-robin and per-peer addressing.
///
/// The member set is fixed at build time; the bound subset tracks binds
/// and closes, so `binded_count() <= total_count()` always holds.
pub struct ClientList {
    clients: Vec<PeerClient>,
    binded: Arc<Mutex<BTreeMap<String, usize>>>,
    cursor: Mutex<usize>,
}

impl ClientList {
    /// Start building a client list.
    pub fn builder() -> ClientListBuilder {
        ClientListBuilder::default()
    }

    /// Begin connecting every member.
    pub fn start(&self) {
        for client in &self.clients {
            client.start();
        }
    }

    /// Stop every member.
    pub fn stop(&self) {
        for client in &self.clients {
            client.stop();
        }
    }

    /// Number of members currently bound.
    pub fn binded_count(&self) -> usize {
        self.binded.lock().len()
    }

    /// Number of members overall.
    pub fn total_count(&self) -> usize {
        self.clients.len()
    }

    /// Server identities of the bound members.
    pub fn binded_ids(&self) -> Vec<String> {
        self.binded.lock().keys().cloned().collect()
    }

    /// Send a tracked request to the peer bound as `server_id`.
    pub fn send_request(&self, message: &str, server_id: &str) -> Result<u32> {
        self.member(server_id)?.send_request(message)
    }

    /// Answer a request received from `server_id`.
    pub fn send_response(&self, message: &str, sequence: u32, server_id: &str) -> Result<()> {
        self.member(server_id)?.send_response(message, sequence)
    }

    /// Send a tracked request to the next bound peer in round-robin order.
    pub fn send_request_round_robin(&self, message: &str) -> Result<(u32, String)> {
        let server_id = {
            let binded = self.binded.lock();
            if binded.is_empty() {
                return Err(FramelinkError::Protocol("No bound peers".into()));
            }
            let mut cursor = self.cursor.lock();
            let index = *cursor % binded.len();
            *cursor = (*cursor + 1) % binded.len();
            binded.keys().nth(index).cloned().unwrap_or_default()
        };
        let sequence = self.send_request(message, &server_id)?;
        Ok((sequence, server_id))
    }

    /// Send an untracked request to every bound peer. Broadcasts expect no
    /// reply, so nothing lands in the outstanding tables and no timeout
    /// ever fires for them. Returns one `(server id, sequence)` pair per
    /// successful send.
    pub fn broadcast(&self, message: &str) -> Vec<(String, u32)> {
        let targets = self.binded_ids();
        let mut sent = Vec::with_capacity(targets.len());
        for server_id in targets {
            let result = self
                .member(&server_id)
                .and_then(|member| member.send_info(message));
            match result {
                Ok(sequence) => sent.push((server_id, sequence)),
                Err(err) => {
                    tracing::warn!(%server_id, %err, "broadcast send failed");
                }
            }
        }
        sent
    }

    fn member(&self, server_id: &str) -> Result<&PeerClient> {
        let index = self
            .binded
            .lock()
            .get(server_id)
            .copied()
            .ok_or_else(|| {
                FramelinkError::Protocol(format!("No bound peer with id {server_id:?}"))
            })?;
        Ok(&self.clients[index])
    }
}

/// Fluent builder for [`ClientList`].
pub struct ClientListBuilder {
    addresses: Vec<SocketAddr>,
    client_id: String,
    request_timeout: Duration,
    inactivity_timeout: Duration,
    reconnect_delay: Duration,
    auto_reconnect: bool,
    session_config: SessionConfig,
    expirator_kind: ExpiratorKind,
    request_handler: Option<SharedPacketHandler>,
    response_handler: Option<SharedPacketHandler>,
    timeout_handler: Option<SharedPacketHandler>,
    session_event_handler: Option<Arc<dyn Fn(&str, SessionEvent) + Send + Sync>>,
}

impl Default for ClientListBuilder {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
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
            session_event_handler: None,
        }
    }
}

impl ClientListBuilder {
    /// Add a server endpoint to the member set.
    pub fn with_address(mut self, addr: SocketAddr) -> Self {
        self.addresses.push(addr);
        self
    }

    /// Add several server endpoints.
    pub fn with_addresses(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.addresses.extend(addrs);
        self
    }

    /// Identity every member binds as.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Per-request timeout for every member.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Keep-alive idle time for every member.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Pause between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Reconnect members automatically.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Session configuration for every member.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Which expirator implementation tracks outstanding requests.
    pub fn with_expirator_kind(mut self, kind: ExpiratorKind) -> Self {
        self.expirator_kind = kind;
        self
    }

    /// Shared handler for incoming requests. Required.
    pub fn with_request_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, u32, String) + Send + Sync + 'static,
    {
        self.request_handler = Some(Arc::new(handler));
        self
    }

    /// Shared handler for responses to tracked requests. Required.
    pub fn with_response_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, u32, String) + Send + Sync + 'static,
    {
        self.response_handler = Some(Arc::new(handler));
        self
    }

    /// Shared handler for requests that timed out. Required.
    pub fn with_timeout_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, u32, String) + Send + Sync + 'static,
    {
        self.timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Shared lifecycle event stream.
    pub fn with_session_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, SessionEvent) + Send + Sync + 'static,
    {
        self.session_event_handler = Some(Arc::new(handler));
        self
    }

    /// Validate and build every member. Does not connect; call
    /// [`ClientList::start`].
    pub fn build(self) -> Result<ClientList> {
        if self.addresses.is_empty() {
            return Err(FramelinkError::InvalidConfig(
                "ClientList requires at least one address".into(),
            ));
        }
        let request_handler = self.request_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("ClientList requires a request handler".into())
        })?;
        let response_handler = self.response_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("ClientList requires a response handler".into())
        })?;
        let timeout_handler = self.timeout_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("ClientList requires a timeout handler".into())
        })?;

        let binded: Arc<Mutex<BTreeMap<String, usize>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let mut clients = Vec::with_capacity(self.addresses.len());

        for (index, addr) in self.addresses.iter().copied().enumerate() {
            let request_handler = request_handler.clone();
            let response_handler = response_handler.clone();
            let timeout_handler = timeout_handler.clone();

            let bound_binded = binded.clone();
            let closed_binded = binded.clone();

            let mut builder = PeerClient::builder()
                .with_address(addr)
                .with_client_id(self.client_id.clone())
                .with_request_timeout(self.request_timeout)
                .with_inactivity_timeout(self.inactivity_timeout)
                .with_reconnect_delay(self.reconnect_delay)
                .with_auto_reconnect(self.auto_reconnect)
                .with_session_config(self.session_config.clone())
                .with_expirator_kind(self.expirator_kind)
                .with_request_handler(move |id, seq, msg| (*request_handler)(id, seq, msg))
                .with_response_handler(move |id, seq, msg| (*response_handler)(id, seq, msg))
                .with_timeout_handler(move |id, seq, msg| (*timeout_handler)(id, seq, msg))
                .with_bound_handler(move |server_id| {
                    bound_binded.lock().insert(server_id.to_string(), index);
                })
                .with_closed_handler(move |server_id| {
                    closed_binded.lock().remove(server_id);
                });

            if let Some(events) = self.session_event_handler.clone() {
                builder = builder
                    .with_session_event_handler(move |id, event| (*events)(id, event));
            }

            clients.push(builder.build()?);
        }

        Ok(ClientList {
            clients,
            binded,
            cursor: Mutex::new(0),
        })
    }
}
